//! Attributes derived from a certificate value.
//!
//! Derivation is best effort: a value that cannot be decoded yields an error
//! the caller logs and ignores.

use der::{Encode, asn1::IntRef};
use pkcs11_sys::{CKA_ISSUER, CKA_SERIAL_NUMBER, CKA_SUBJECT};
use tracing::debug;
use x509_parser::{
    der_parser::ber::{Class, Tag, parse_ber_any},
    prelude::{FromDer, X509Certificate},
};

use crate::{
    ModuleError, ModuleResult,
    core::attribute::{Attribute, Attributes},
};

// Application class tag numbers of BSI TR-03110 card verifiable certificates.
const TAG_CVC_AUTHENTICATED_REQUEST: Tag = Tag(0x07);
const TAG_CVC_CERTIFICATE: Tag = Tag(0x21);
const TAG_CVC_BODY: Tag = Tag(0x4E);
const TAG_CVC_CAR: Tag = Tag(0x02);
const TAG_CVC_CHR: Tag = Tag(0x20);

/// Issuer, subject and serial number of a DER encoded X.509 certificate.
///
/// The serial number is returned DER encoded as an INTEGER, the names as
/// their raw DER `Name`.
pub fn x509_attributes(value: &[u8]) -> ModuleResult<Vec<Attribute>> {
    let (_, certificate) = X509Certificate::from_der(value)
        .map_err(|e| ModuleError::Default(format!("failed to parse certificate: {e}")))?;
    let tbs = &certificate.tbs_certificate;
    Ok(vec![
        Attribute::new(CKA_ISSUER, tbs.issuer.as_raw()),
        Attribute::new(CKA_SUBJECT, tbs.subject.as_raw()),
        Attribute::new(CKA_SERIAL_NUMBER, &serial_number(tbs.raw_serial())?),
    ])
}

/// Certification authority reference and holder reference of a card
/// verifiable certificate, exposed as issuer and subject.
pub fn cvc_attributes(value: &[u8]) -> ModuleResult<Vec<Attribute>> {
    let mut element = application_element(value)?;
    if element.0 == TAG_CVC_AUTHENTICATED_REQUEST {
        element = application_element(element.1)?;
    }
    let (tag, certificate) = element;
    if tag != TAG_CVC_CERTIFICATE {
        return Err(ModuleError::Default(format!(
            "not a card verifiable certificate, tag {:#x}",
            tag.0
        )));
    }
    let (tag, mut content) = application_element(certificate)?;
    if tag != TAG_CVC_BODY {
        return Err(ModuleError::Default(format!(
            "missing certificate body, tag {:#x}",
            tag.0
        )));
    }

    let mut attributes = Vec::with_capacity(2);
    while !content.is_empty() {
        let (rest, field) = parse_ber_any(content)
            .map_err(|e| ModuleError::Default(format!("invalid certificate body: {e:?}")))?;
        if field.class() == Class::Application {
            match field.tag() {
                TAG_CVC_CAR => attributes.push(Attribute::new(CKA_ISSUER, field.data)),
                TAG_CVC_CHR => attributes.push(Attribute::new(CKA_SUBJECT, field.data)),
                _ => {}
            }
        }
        content = rest;
    }
    Ok(attributes)
}

/// The tag and content of the application class element starting `data`.
fn application_element(data: &[u8]) -> ModuleResult<(Tag, &[u8])> {
    let (_, element) = parse_ber_any(data)
        .map_err(|e| ModuleError::Default(format!("invalid BER element: {e:?}")))?;
    if element.class() != Class::Application {
        return Err(ModuleError::Default(format!(
            "unexpected {} class element",
            element.class()
        )));
    }
    Ok((element.tag(), element.data))
}

/// DER INTEGER encoding of the raw serial number content.
fn serial_number(raw: &[u8]) -> ModuleResult<Vec<u8>> {
    IntRef::new(raw)
        .and_then(|serial| serial.to_der())
        .map_err(|e| ModuleError::Default(format!("invalid serial number: {e}")))
}

/// Add the derived attributes to `attributes` without overwriting the ones
/// already provided.
pub fn populate(
    attributes: &mut Attributes,
    derive: fn(&[u8]) -> ModuleResult<Vec<Attribute>>,
    value: &[u8],
) {
    match derive(value) {
        Ok(derived) => {
            for attribute in derived {
                attributes.insert_if_absent(attribute);
            }
        }
        Err(e) => debug!("populating additional certificate attributes failed: {e}"),
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use pkcs11_sys::CKA_LABEL;

    use super::*;

    fn tlv(tag: &[u8], value: &[u8]) -> Vec<u8> {
        let mut out = tag.to_vec();
        assert!(value.len() < 0x80);
        out.push(u8::try_from(value.len()).unwrap());
        out.extend_from_slice(value);
        out
    }

    fn cvc(car: &[u8], chr: &[u8]) -> Vec<u8> {
        let mut body = tlv(&[0x5F, 0x29], &[0x00]);
        body.extend(tlv(&[0x42], car));
        body.extend(tlv(&[0x7F, 0x49], &[0x06, 0x01, 0x00]));
        body.extend(tlv(&[0x5F, 0x20], chr));
        let mut certificate = tlv(&[0x7F, 0x4E], &body);
        certificate.extend(tlv(&[0x5F, 0x37], &[0xAA; 32]));
        tlv(&[0x7F, 0x21], &certificate)
    }

    #[test]
    fn cvc_references() {
        let attributes = cvc_attributes(&cvc(b"UTCA00001", b"UTDV00001")).unwrap();
        assert_eq!(attributes.len(), 2);
        assert_eq!(attributes[0].type_(), CKA_ISSUER);
        assert_eq!(attributes[0].value(), b"UTCA00001");
        assert_eq!(attributes[1].type_(), CKA_SUBJECT);
        assert_eq!(attributes[1].value(), b"UTDV00001");

        let request = tlv(&[0x67], &cvc(b"CAR", b"CHR"));
        assert_eq!(cvc_attributes(&request).unwrap()[1].value(), b"CHR");
    }

    #[test]
    fn garbage_is_reported_not_panicking() {
        cvc_attributes(&[]).unwrap_err();
        cvc_attributes(&[0x7F, 0x21, 0x82, 0x01]).unwrap_err();
        cvc_attributes(&[0x30, 0x00]).unwrap_err();
        x509_attributes(b"not a certificate").unwrap_err();
    }

    #[test]
    fn serial_numbers_are_der_integers() {
        assert_eq!(serial_number(&[0x01, 0x02]).unwrap(), vec![0x02, 0x02, 0x01, 0x02]);
        assert_eq!(
            serial_number(&[0x00, 0x81]).unwrap(),
            vec![0x02, 0x02, 0x00, 0x81]
        );
    }

    #[test]
    fn derived_values_never_overwrite_the_template() {
        let mut attributes: Attributes = vec![
            Attribute::new(CKA_LABEL, b"cvc"),
            Attribute::new(CKA_SUBJECT, b"given subject"),
        ]
        .into();
        populate(&mut attributes, cvc_attributes, &cvc(b"CAR", b"CHR"));
        assert_eq!(attributes.get(CKA_ISSUER).unwrap().value(), b"CAR");
        assert_eq!(attributes.get(CKA_SUBJECT).unwrap().value(), b"given subject");

        // failures leave the attributes untouched
        populate(&mut attributes, x509_attributes, b"garbage");
        assert_eq!(attributes.len(), 3);
    }
}
