// Copyright 2024 Cosmian Tech SAS
// Changes made to the original code are
// licensed under the Business Source License version 1.1.
//
// This :
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

use pkcs11_sys::{
    CK_CERTIFICATE_TYPE, CK_INVALID_HANDLE, CK_OBJECT_CLASS, CK_OBJECT_HANDLE,
    CKA_CERTIFICATE_TYPE, CKA_CLASS, CKA_PRIVATE, CKA_SENSITIVE, CKA_TOKEN, CKA_VALUE,
    CKC_VENDOR_DEFINED, CKC_X_509, CKO_CERTIFICATE, CKO_DATA, CKO_PRIVATE_KEY, CKO_PUBLIC_KEY,
    CKO_SECRET_KEY,
};
use strum_macros::Display;
use tracing::debug;

use crate::{
    ModuleError, ModuleResult,
    core::{
        attribute::{Attribute, Attributes},
        certificate,
    },
};

/// Card verifiable certificates as defined by BSI TR-03110.
pub const CKC_CVC_TR3110: CK_CERTIFICATE_TYPE = CKC_VENDOR_DEFINED | 1;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum CertificateKind {
    X509,
    Cvc,
}

impl TryFrom<CK_CERTIFICATE_TYPE> for CertificateKind {
    type Error = ModuleError;

    fn try_from(certificate_type: CK_CERTIFICATE_TYPE) -> ModuleResult<Self> {
        match certificate_type {
            CKC_X_509 => Ok(Self::X509),
            CKC_CVC_TR3110 => Ok(Self::Cvc),
            _ => Err(ModuleError::AttributeValueInvalid(CKA_CERTIFICATE_TYPE)),
        }
    }
}

/// The object classes the module manages.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Certificate(CertificateKind),
    Data,
    PublicKey,
    PrivateKey,
    SecretKey,
}

impl ObjectKind {
    /// Determine the kind from `CKA_CLASS` and, for certificates,
    /// `CKA_CERTIFICATE_TYPE`.
    pub fn from_template(template: &Attributes) -> ModuleResult<Self> {
        match template.get_class()? {
            CKO_CERTIFICATE => {
                let certificate_type = template.get_certificate_type()?;
                Ok(Self::Certificate(CertificateKind::try_from(
                    certificate_type,
                )?))
            }
            CKO_DATA => Ok(Self::Data),
            CKO_PUBLIC_KEY => Ok(Self::PublicKey),
            CKO_PRIVATE_KEY => Ok(Self::PrivateKey),
            CKO_SECRET_KEY => Ok(Self::SecretKey),
            _ => Err(ModuleError::AttributeValueInvalid(CKA_CLASS)),
        }
    }

    #[must_use]
    pub const fn class(self) -> CK_OBJECT_CLASS {
        match self {
            Self::Certificate(_) => CKO_CERTIFICATE,
            Self::Data => CKO_DATA,
            Self::PublicKey => CKO_PUBLIC_KEY,
            Self::PrivateKey => CKO_PRIVATE_KEY,
            Self::SecretKey => CKO_SECRET_KEY,
        }
    }

    /// Best effort derivation of secondary attributes from `CKA_VALUE`.
    pub(crate) fn populate(self, attributes: &mut Attributes) {
        let Some(value) = attributes.get(CKA_VALUE).map(|v| v.value().to_vec()) else {
            debug!("no value to derive {self} attributes from");
            return;
        };
        match self {
            Self::Certificate(CertificateKind::X509) => {
                certificate::populate(attributes, certificate::x509_attributes, &value);
            }
            Self::Certificate(CertificateKind::Cvc) => {
                certificate::populate(attributes, certificate::cvc_attributes, &value);
            }
            _ => {}
        }
    }
}

/// Where an object lives; an object is owned by exactly one of these.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum StorageLocation {
    Session,
    TokenPublic,
    TokenPrivate,
}

/// A managed object: its attributes plus the flags derived from them.
#[derive(Debug, Clone)]
pub struct Object {
    handle: CK_OBJECT_HANDLE,
    kind: ObjectKind,
    attributes: Attributes,
    token_obj: bool,
    public_obj: bool,
    sensitive_obj: bool,
    dirty: bool,
}

impl Object {
    /// Build an object from a creation template.
    ///
    /// The first occurrence of each attribute type is kept. The handle is
    /// assigned when the object is stored.
    pub fn from_template(template: &Attributes) -> ModuleResult<Self> {
        let attributes = template.deduplicated();
        let kind = ObjectKind::from_template(&attributes)?;
        let token_obj = attributes.get_bool(CKA_TOKEN)?.unwrap_or(false);
        let private = attributes.get_bool(CKA_PRIVATE)?.unwrap_or(false);
        let sensitive_obj = attributes.get_bool(CKA_SENSITIVE)?.unwrap_or(false);
        Ok(Self {
            handle: CK_INVALID_HANDLE,
            kind,
            attributes,
            token_obj,
            public_obj: !private,
            sensitive_obj,
            dirty: false,
        })
    }

    #[must_use]
    pub const fn handle(&self) -> CK_OBJECT_HANDLE {
        self.handle
    }

    pub(crate) fn set_handle(&mut self, handle: CK_OBJECT_HANDLE) {
        self.handle = handle;
    }

    #[must_use]
    pub const fn kind(&self) -> ObjectKind {
        self.kind
    }

    #[must_use]
    pub const fn class(&self) -> CK_OBJECT_CLASS {
        self.kind.class()
    }

    #[must_use]
    pub const fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    #[must_use]
    pub fn attribute(&self, type_: pkcs11_sys::CK_ATTRIBUTE_TYPE) -> Option<&Attribute> {
        self.attributes.get(type_)
    }

    #[must_use]
    pub const fn is_token(&self) -> bool {
        self.token_obj
    }

    #[must_use]
    pub const fn is_public(&self) -> bool {
        self.public_obj
    }

    #[must_use]
    pub const fn is_sensitive(&self) -> bool {
        self.sensitive_obj
    }

    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[must_use]
    pub const fn location(&self) -> StorageLocation {
        match (self.token_obj, self.public_obj) {
            (false, _) => StorageLocation::Session,
            (true, true) => StorageLocation::TokenPublic,
            (true, false) => StorageLocation::TokenPrivate,
        }
    }

    /// True when every attribute of `template` is present on this object
    /// with the same bytes.
    #[must_use]
    pub fn matches(&self, template: &Attributes) -> bool {
        self.attributes.contains_all(template)
    }

    /// Size of the serialized attribute list, the footprint of the object
    /// once persisted.
    pub fn size(&self) -> ModuleResult<u64> {
        Ok(bincode::serialized_size(&self.attributes)?)
    }

    pub(crate) fn populate_derived_attributes(&mut self) {
        self.kind.populate(&mut self.attributes);
    }

    /// Overwrite the value of an existing attribute and mark the object dirty.
    pub(crate) fn update_attribute(&mut self, attribute: &Attribute) -> ModuleResult<()> {
        let existing = self
            .attributes
            .get_mut(attribute.type_())
            .ok_or_else(|| {
                ModuleError::TemplateIncomplete(format!(
                    "object {} has no attribute {}",
                    self.handle,
                    crate::core::attribute::attribute_name(attribute.type_())
                ))
            })?;
        if attribute.type_() == CKA_SENSITIVE {
            // Sensitivity is one way.
            if !attribute.as_bool()? && self.sensitive_obj {
                return Err(ModuleError::AttributeReadOnly(CKA_SENSITIVE));
            }
            self.sensitive_obj = attribute.as_bool()?;
        }
        existing.set_value(attribute.value());
        self.dirty = true;
        Ok(())
    }

    /// Switch the object to private, keeping `CKA_PRIVATE` in step.
    pub(crate) fn make_private(&mut self) {
        self.attributes
            .upsert(Attribute::from_bool(CKA_PRIVATE, true));
        self.public_obj = false;
        self.dirty = true;
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = false;
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use pkcs11_sys::{CKA_LABEL, CKO_VENDOR_DEFINED, CKR_ATTRIBUTE_VALUE_INVALID, CK_RV};

    use super::*;

    fn data_template(private: bool) -> Attributes {
        vec![
            Attribute::from_ulong(CKA_CLASS, CKO_DATA),
            Attribute::from_bool(CKA_TOKEN, true),
            Attribute::from_bool(CKA_PRIVATE, private),
            Attribute::new(CKA_LABEL, b"data"),
        ]
        .into()
    }

    #[test]
    fn flags_follow_the_template() {
        let object = Object::from_template(&data_template(false)).unwrap();
        assert_eq!(object.kind(), ObjectKind::Data);
        assert_eq!(object.handle(), CK_INVALID_HANDLE);
        assert!(object.is_token());
        assert!(object.is_public());
        assert!(!object.is_sensitive());
        assert_eq!(object.location(), StorageLocation::TokenPublic);

        let object = Object::from_template(&data_template(true)).unwrap();
        assert_eq!(object.location(), StorageLocation::TokenPrivate);

        let session: Attributes = vec![Attribute::from_ulong(CKA_CLASS, CKO_DATA)].into();
        let object = Object::from_template(&session).unwrap();
        assert_eq!(object.location(), StorageLocation::Session);
        assert!(object.is_public());
    }

    #[test]
    fn certificate_kinds() {
        let template: Attributes = vec![
            Attribute::from_ulong(CKA_CLASS, CKO_CERTIFICATE),
            Attribute::from_ulong(CKA_CERTIFICATE_TYPE, CKC_CVC_TR3110),
        ]
        .into();
        assert_eq!(
            ObjectKind::from_template(&template).unwrap(),
            ObjectKind::Certificate(CertificateKind::Cvc)
        );

        let template: Attributes = vec![
            Attribute::from_ulong(CKA_CLASS, CKO_CERTIFICATE),
            Attribute::from_ulong(CKA_CERTIFICATE_TYPE, CKC_VENDOR_DEFINED | 2),
        ]
        .into();
        let err = ObjectKind::from_template(&template).unwrap_err();
        assert_eq!(CK_RV::from(err), CKR_ATTRIBUTE_VALUE_INVALID);

        let template: Attributes =
            vec![Attribute::from_ulong(CKA_CLASS, CKO_VENDOR_DEFINED)].into();
        ObjectKind::from_template(&template).unwrap_err();
    }

    #[test]
    fn updates_and_relocation_mark_dirty() {
        let mut object = Object::from_template(&data_template(false)).unwrap();
        let size = object.size().unwrap();

        object
            .update_attribute(&Attribute::new(CKA_LABEL, b"a longer label"))
            .unwrap();
        assert!(object.is_dirty());
        assert_eq!(object.attribute(CKA_LABEL).unwrap().value(), b"a longer label");
        assert_eq!(object.size().unwrap(), size + 10);

        object
            .update_attribute(&Attribute::new(CKA_VALUE, b"x"))
            .unwrap_err();

        object.clear_dirty();
        object.make_private();
        assert!(object.is_dirty());
        assert_eq!(object.location(), StorageLocation::TokenPrivate);
        assert!(
            object
                .attributes()
                .get_bool(CKA_PRIVATE)
                .unwrap()
                .unwrap()
        );
    }
}
