// Copyright 2024 Cosmian Tech SAS
// Changes made to the original code are
// licensed under the Business Source License version 1.1.
//
//Original code:
// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Attribute records and templates.
//!
//! A template is an ordered list of `(type, value)` pairs. It describes a new
//! object on creation and filters existing objects on search. Values are kept
//! as raw bytes so that matching is a byte comparison and unknown attribute
//! types survive unchanged.

use std::{fmt, mem::size_of, ops::Deref, slice};

use pkcs11_sys::{
    CK_ATTRIBUTE, CK_ATTRIBUTE_PTR, CK_ATTRIBUTE_TYPE, CK_BBOOL, CK_CERTIFICATE_TYPE, CK_FALSE,
    CK_OBJECT_CLASS, CK_TRUE, CK_ULONG, CKA_APPLICATION, CKA_CERTIFICATE_CATEGORY,
    CKA_CERTIFICATE_TYPE, CKA_CHECK_VALUE, CKA_CLASS, CKA_DESTROYABLE, CKA_END_DATE,
    CKA_EXTRACTABLE, CKA_ID, CKA_ISSUER, CKA_KEY_TYPE, CKA_LABEL, CKA_MODIFIABLE, CKA_OBJECT_ID,
    CKA_PRIVATE, CKA_SENSITIVE, CKA_SERIAL_NUMBER, CKA_START_DATE, CKA_SUBJECT, CKA_TOKEN,
    CKA_TRUSTED, CKA_URL, CKA_VALUE,
};
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use tracing::trace;
use zeroize::Zeroize;

use crate::{ModuleError, ModuleResult};

/// The attribute types the object core reasons about.
///
/// Other types are accepted in templates and stored verbatim; this list only
/// gives names to the ones with a known encoding.
#[derive(Debug, Display, PartialEq, Eq, Clone, Copy)]
pub enum AttributeType {
    Application,
    CertificateCategory,
    CertificateType,
    CheckValue,
    Class,
    Destroyable,
    EndDate,
    Extractable,
    Id,
    Issuer,
    KeyType,
    Label,
    Modifiable,
    ObjectId,
    Private,
    SerialNumber,
    Sensitive,
    StartDate,
    Subject,
    Token,
    Trusted,
    Url,
    Value,
}

impl TryFrom<CK_ATTRIBUTE_TYPE> for AttributeType {
    type Error = ModuleError;

    fn try_from(type_: CK_ATTRIBUTE_TYPE) -> ModuleResult<Self> {
        match type_ {
            CKA_APPLICATION => Ok(Self::Application),
            CKA_CERTIFICATE_CATEGORY => Ok(Self::CertificateCategory),
            CKA_CERTIFICATE_TYPE => Ok(Self::CertificateType),
            CKA_CHECK_VALUE => Ok(Self::CheckValue),
            CKA_CLASS => Ok(Self::Class),
            CKA_DESTROYABLE => Ok(Self::Destroyable),
            CKA_END_DATE => Ok(Self::EndDate),
            CKA_EXTRACTABLE => Ok(Self::Extractable),
            CKA_ID => Ok(Self::Id),
            CKA_ISSUER => Ok(Self::Issuer),
            CKA_KEY_TYPE => Ok(Self::KeyType),
            CKA_LABEL => Ok(Self::Label),
            CKA_MODIFIABLE => Ok(Self::Modifiable),
            CKA_OBJECT_ID => Ok(Self::ObjectId),
            CKA_PRIVATE => Ok(Self::Private),
            CKA_SERIAL_NUMBER => Ok(Self::SerialNumber),
            CKA_SENSITIVE => Ok(Self::Sensitive),
            CKA_START_DATE => Ok(Self::StartDate),
            CKA_SUBJECT => Ok(Self::Subject),
            CKA_TOKEN => Ok(Self::Token),
            CKA_TRUSTED => Ok(Self::Trusted),
            CKA_URL => Ok(Self::Url),
            CKA_VALUE => Ok(Self::Value),
            _ => Err(ModuleError::AttributeTypeInvalid(type_)),
        }
    }
}

impl AttributeType {
    /// The encoded width of fixed-size attributes, `None` for byte strings.
    #[must_use]
    pub const fn fixed_size(self) -> Option<usize> {
        match self {
            Self::CertificateCategory | Self::CertificateType | Self::Class | Self::KeyType => {
                Some(size_of::<CK_ULONG>())
            }
            Self::Destroyable
            | Self::Extractable
            | Self::Modifiable
            | Self::Private
            | Self::Sensitive
            | Self::Token
            | Self::Trusted => Some(size_of::<CK_BBOOL>()),
            _ => None,
        }
    }
}

/// A readable name for logs and error messages.
#[must_use]
pub fn attribute_name(type_: CK_ATTRIBUTE_TYPE) -> String {
    AttributeType::try_from(type_).map_or_else(|_| format!("{type_:#x}"), |t| t.to_string())
}

/// One `(type, value)` record owning its value buffer.
///
/// The buffer is wiped when the record is dropped or overwritten.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    type_: CK_ATTRIBUTE_TYPE,
    value: Vec<u8>,
}

impl Attribute {
    #[must_use]
    pub fn new(type_: CK_ATTRIBUTE_TYPE, value: &[u8]) -> Self {
        Self {
            type_,
            value: value.to_vec(),
        }
    }

    #[must_use]
    pub fn from_bool(type_: CK_ATTRIBUTE_TYPE, value: bool) -> Self {
        let byte: CK_BBOOL = if value { CK_TRUE } else { CK_FALSE };
        Self::new(type_, &byte.to_ne_bytes())
    }

    #[must_use]
    pub fn from_ulong(type_: CK_ATTRIBUTE_TYPE, value: CK_ULONG) -> Self {
        Self::new(type_, &value.to_ne_bytes())
    }

    #[must_use]
    pub const fn type_(&self) -> CK_ATTRIBUTE_TYPE {
        self.type_
    }

    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.value.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// Replace the value in place.
    ///
    /// The current buffer is reused unless the new value does not fit in it.
    pub fn set_value(&mut self, value: &[u8]) {
        self.value.zeroize();
        if value.len() > self.value.capacity() {
            self.value = Vec::with_capacity(value.len());
        }
        self.value.extend_from_slice(value);
    }

    /// Check the value has exactly the width of its fixed-size encoding.
    pub fn validate(&self, expected_size: usize) -> ModuleResult<()> {
        if self.value.len() != expected_size {
            return Err(ModuleError::AttributeValueInvalid(self.type_));
        }
        Ok(())
    }

    pub fn as_bool(&self) -> ModuleResult<bool> {
        self.validate(size_of::<CK_BBOOL>())?;
        try_u8_into_bool(&self.value)
    }

    pub fn as_ulong(&self) -> ModuleResult<CK_ULONG> {
        self.validate(size_of::<CK_ULONG>())?;
        Ok(CK_ULONG::from_ne_bytes(self.value.as_slice().try_into()?))
    }
}

impl Drop for Attribute {
    fn drop(&mut self) {
        self.value.zeroize();
    }
}

impl fmt::Debug for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // never print secret material
        if self.type_ == CKA_VALUE {
            write!(f, "{}: <{} bytes>", attribute_name(self.type_), self.value.len())
        } else {
            write!(
                f,
                "{}: {}",
                attribute_name(self.type_),
                hex::encode(&self.value)
            )
        }
    }
}

// Borrowed from:
// https://github.com/parallaxsecond/rust-cryptoki/blob/89055f2a30e30d07a99e5904e9231d743c75d8e5/cryptoki/src/object.rs#L769
fn try_u8_into_bool(slice: &[u8]) -> ModuleResult<bool> {
    let as_array: [u8; size_of::<CK_BBOOL>()] = slice.try_into()?;
    let as_byte = CK_BBOOL::from_ne_bytes(as_array);
    Ok(!matches!(as_byte, 0u8))
}

/// An ordered template of attribute records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes(Vec<Attribute>);

impl Attributes {
    /// Read a caller supplied `CK_ATTRIBUTE` array.
    ///
    /// # Safety
    /// `template` must point to `count` readable `CK_ATTRIBUTE` whose value
    /// pointers reference at least `ulValueLen` readable bytes.
    pub unsafe fn from_raw_template(
        template: CK_ATTRIBUTE_PTR,
        count: CK_ULONG,
    ) -> ModuleResult<Self> {
        if count == 0 {
            return Ok(Self::default());
        }
        if template.is_null() {
            return Err(ModuleError::BadArguments(
                "template is a null pointer".to_owned(),
            ));
        }
        let raw: &[CK_ATTRIBUTE] =
            unsafe { slice::from_raw_parts(template, usize::try_from(count)?) };
        let mut attributes = Vec::with_capacity(raw.len());
        for attribute in raw {
            let len = usize::try_from(attribute.ulValueLen)?;
            let value = if len > 0 {
                if attribute.pValue.is_null() {
                    return Err(ModuleError::BadArguments(format!(
                        "value of attribute {} is a null pointer",
                        attribute_name(attribute.type_)
                    )));
                }
                unsafe { slice::from_raw_parts(attribute.pValue.cast::<u8>(), len) }
            } else {
                &[]
            };
            attributes.push(Attribute::new(attribute.type_, value));
        }
        let attributes = Self(attributes);
        trace!("Parsed template: {attributes:?}");
        Ok(attributes)
    }

    /// Position of the first record of the given type, in template order.
    #[must_use]
    pub fn position(&self, type_: CK_ATTRIBUTE_TYPE) -> Option<usize> {
        self.0.iter().position(|attr| attr.type_ == type_)
    }

    #[must_use]
    pub fn get(&self, type_: CK_ATTRIBUTE_TYPE) -> Option<&Attribute> {
        self.position(type_).map(|pos| &self.0[pos])
    }

    pub(crate) fn get_mut(&mut self, type_: CK_ATTRIBUTE_TYPE) -> Option<&mut Attribute> {
        self.0.iter_mut().find(|attr| attr.type_ == type_)
    }

    /// Fetch a mandatory fixed-size attribute and check its width.
    pub fn get_required(&self, type_: CK_ATTRIBUTE_TYPE) -> ModuleResult<&Attribute> {
        let attribute = self.get(type_).ok_or_else(|| {
            ModuleError::TemplateIncomplete(format!(
                "{} not found in template",
                attribute_name(type_)
            ))
        })?;
        if let Some(size) = AttributeType::try_from(type_)
            .ok()
            .and_then(AttributeType::fixed_size)
        {
            attribute.validate(size)?;
        }
        Ok(attribute)
    }

    pub fn get_class(&self) -> ModuleResult<CK_OBJECT_CLASS> {
        self.get_required(CKA_CLASS)?.as_ulong()
    }

    pub fn get_certificate_type(&self) -> ModuleResult<CK_CERTIFICATE_TYPE> {
        self.get_required(CKA_CERTIFICATE_TYPE)?.as_ulong()
    }

    /// Value of an optional boolean attribute.
    pub fn get_bool(&self, type_: CK_ATTRIBUTE_TYPE) -> ModuleResult<Option<bool>> {
        self.get(type_).map(Attribute::as_bool).transpose()
    }

    /// Value of an optional `CK_ULONG` attribute.
    pub fn get_ulong(&self, type_: CK_ATTRIBUTE_TYPE) -> ModuleResult<Option<CK_ULONG>> {
        self.get(type_).map(Attribute::as_ulong).transpose()
    }

    /// True when every record of `template` is present, byte for byte, here.
    ///
    /// The empty template matches anything.
    #[must_use]
    pub fn contains_all(&self, template: &Self) -> bool {
        template.0.iter().all(|wanted| {
            self.get(wanted.type_)
                .is_some_and(|attr| attr.value == wanted.value)
        })
    }

    /// Copy of this template keeping only the first record of each type.
    #[must_use]
    pub fn deduplicated(&self) -> Self {
        let mut unique: Vec<Attribute> = Vec::with_capacity(self.0.len());
        for attribute in &self.0 {
            if unique.iter().any(|a| a.type_ == attribute.type_) {
                trace!("ignoring duplicate {attribute:?} in template");
                continue;
            }
            unique.push(attribute.clone());
        }
        Self(unique)
    }

    /// Add a record unless one of the same type is already present.
    pub fn insert_if_absent(&mut self, attribute: Attribute) {
        if self.position(attribute.type_).is_none() {
            self.0.push(attribute);
        }
    }

    /// Add a record or replace the value of the existing one.
    pub fn upsert(&mut self, attribute: Attribute) {
        match self.get_mut(attribute.type_) {
            Some(existing) => existing.set_value(attribute.value()),
            None => self.0.push(attribute),
        }
    }
}

impl Deref for Attributes {
    type Target = Vec<Attribute>;

    fn deref(&self) -> &Vec<Attribute> {
        &self.0
    }
}

impl From<Vec<Attribute>> for Attributes {
    fn from(value: Vec<Attribute>) -> Self {
        Self(value)
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use std::ptr;

    use pkcs11_sys::{CKC_X_509, CKO_CERTIFICATE, CKR_ATTRIBUTE_VALUE_INVALID, CK_RV};

    use super::*;

    fn certificate_template() -> Attributes {
        vec![
            Attribute::from_ulong(CKA_CLASS, CKO_CERTIFICATE),
            Attribute::from_ulong(CKA_CERTIFICATE_TYPE, CKC_X_509),
            Attribute::new(CKA_LABEL, b"first"),
            Attribute::new(CKA_LABEL, b"second"),
        ]
        .into()
    }

    #[test]
    fn first_occurrence_wins() {
        let template = certificate_template();
        assert_eq!(template.position(CKA_LABEL), Some(2));
        assert_eq!(template.get(CKA_LABEL).unwrap().value(), b"first");
        assert_eq!(template.position(CKA_ID), None);

        let unique = template.deduplicated();
        assert_eq!(unique.len(), 3);
        assert_eq!(unique.get(CKA_LABEL).unwrap().value(), b"first");
    }

    #[test]
    fn fixed_size_attributes_are_validated() {
        let template: Attributes = vec![Attribute::new(CKA_CLASS, &[1, 0])].into();
        let err = template.get_class().unwrap_err();
        assert_eq!(CK_RV::from(err), CKR_ATTRIBUTE_VALUE_INVALID);

        let template: Attributes = vec![Attribute::new(CKA_TOKEN, &[1, 1])].into();
        template.get_bool(CKA_TOKEN).unwrap_err();

        assert!(matches!(
            Attributes::default().get_required(CKA_TOKEN),
            Err(ModuleError::TemplateIncomplete(_))
        ));
        assert_eq!(certificate_template().get_class().unwrap(), CKO_CERTIFICATE);
        assert_eq!(
            certificate_template()
                .get_ulong(CKA_CERTIFICATE_TYPE)
                .unwrap(),
            Some(CKC_X_509)
        );
    }

    #[test]
    fn matching_is_byte_equality_on_every_entry() {
        let object = certificate_template().deduplicated();
        assert!(object.contains_all(&Attributes::default()));
        assert!(object.contains_all(
            &vec![Attribute::from_ulong(CKA_CLASS, CKO_CERTIFICATE)].into()
        ));
        assert!(object.contains_all(&vec![Attribute::new(CKA_LABEL, b"first")].into()));
        assert!(!object.contains_all(&vec![Attribute::new(CKA_LABEL, b"firs")].into()));
        // a missing type never matches, even with an empty value
        assert!(!object.contains_all(&vec![Attribute::new(CKA_ID, b"")].into()));
    }

    #[test]
    fn set_value_reuses_the_buffer_when_it_fits() {
        let mut attribute = Attribute::new(CKA_LABEL, b"a long label");
        let capacity = attribute.value.capacity();
        attribute.set_value(b"short");
        assert_eq!(attribute.value(), b"short");
        assert_eq!(attribute.len(), 5);
        assert_eq!(attribute.value.capacity(), capacity);

        attribute.set_value(b"a label longer than the initial one");
        assert_eq!(attribute.value(), b"a label longer than the initial one");
        assert!(attribute.value.capacity() >= attribute.len());
    }

    #[test]
    fn raw_templates() {
        let class = CKO_CERTIFICATE.to_ne_bytes();
        let mut raw = [
            CK_ATTRIBUTE {
                type_: CKA_CLASS,
                pValue: class.as_ptr() as *mut std::ffi::c_void,
                ulValueLen: class.len() as CK_ULONG,
            },
            CK_ATTRIBUTE {
                type_: CKA_LABEL,
                pValue: ptr::null_mut(),
                ulValueLen: 0,
            },
        ];
        let template = unsafe { Attributes::from_raw_template(raw.as_mut_ptr(), 2) }.unwrap();
        assert_eq!(template.get_class().unwrap(), CKO_CERTIFICATE);
        assert!(template.get(CKA_LABEL).unwrap().is_empty());

        raw[1].ulValueLen = 4;
        unsafe { Attributes::from_raw_template(raw.as_mut_ptr(), 2) }.unwrap_err();
        assert!(
            unsafe { Attributes::from_raw_template(ptr::null_mut(), 0) }
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn debug_output_hides_values() {
        let attribute = Attribute::new(CKA_VALUE, b"secret");
        assert_eq!(format!("{attribute:?}"), "Value: <6 bytes>");
        let attribute = Attribute::new(CKA_LABEL, b"ab");
        assert_eq!(format!("{attribute:?}"), "Label: 6162");
    }
}
