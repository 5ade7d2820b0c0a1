// Copyright 2024 Cosmian Tech SAS
// Changes made to the original code are
// licensed under the Business Source License version 1.1.
//
// Original code:
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

use indexmap::IndexMap;
use pkcs11_sys::{CK_OBJECT_HANDLE, CKA_CERTIFICATE_TYPE, CKA_TOKEN, CKO_CERTIFICATE};
use tracing::{debug, warn};

use crate::{
    ModuleError, ModuleResult,
    core::{
        attribute::{Attributes, attribute_name},
        object::{Object, ObjectKind, StorageLocation},
    },
    sessions::Session,
    synchronization::with_device_recovery,
    traits::Token,
};

pub type ObjectMap = IndexMap<CK_OBJECT_HANDLE, Object>;

/// Issues object handles; 0 is `CK_INVALID_HANDLE` and never issued.
#[derive(Debug)]
pub struct HandleAllocator {
    next: CK_OBJECT_HANDLE,
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl HandleAllocator {
    pub fn allocate(&mut self) -> CK_OBJECT_HANDLE {
        let handle = self.next;
        self.next += 1;
        handle
    }
}

/// The objects held by one token, split by visibility.
///
/// An object lives in exactly one of the two collections and the collection
/// always agrees with its `CKA_PRIVATE` flag.
#[derive(Debug, Default)]
pub struct TokenObjects {
    public: ObjectMap,
    private: ObjectMap,
}

impl TokenObjects {
    pub fn insert(&mut self, object: Object) {
        debug!(
            "inserting object {} in the {} collection",
            object.handle(),
            object.location()
        );
        if object.is_public() {
            self.public.insert(object.handle(), object);
        } else {
            self.private.insert(object.handle(), object);
        }
    }

    /// Lookup by handle, in the public collection only when
    /// `restrict_to_public` is set.
    #[must_use]
    pub fn find(&self, handle: CK_OBJECT_HANDLE, restrict_to_public: bool) -> Option<&Object> {
        self.public.get(&handle).or_else(|| {
            if restrict_to_public {
                None
            } else {
                self.private.get(&handle)
            }
        })
    }

    pub fn find_mut(
        &mut self,
        handle: CK_OBJECT_HANDLE,
        restrict_to_public: bool,
    ) -> Option<&mut Object> {
        if self.public.contains_key(&handle) {
            return self.public.get_mut(&handle);
        }
        if restrict_to_public {
            None
        } else {
            self.private.get_mut(&handle)
        }
    }

    /// Drop an object from memory, keeping the order of the remaining ones.
    pub fn remove(&mut self, handle: CK_OBJECT_HANDLE) -> Option<Object> {
        self.public
            .shift_remove(&handle)
            .or_else(|| self.private.shift_remove(&handle))
    }

    /// Move a public object to the private collection, under the same handle.
    pub fn relocate_to_private(&mut self, handle: CK_OBJECT_HANDLE) -> ModuleResult<()> {
        let mut object = self
            .public
            .shift_remove(&handle)
            .ok_or(ModuleError::ObjectHandleInvalid(handle))?;
        object.make_private();
        debug!("object {handle} moved to the private collection");
        self.private.insert(handle, object);
        Ok(())
    }

    pub fn public(&self) -> impl Iterator<Item = &Object> {
        self.public.values()
    }

    pub fn private(&self) -> impl Iterator<Item = &Object> {
        self.private.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Object> {
        self.public.values_mut().chain(self.private.values_mut())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.public.len() + self.private.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn location_of(&self, handle: CK_OBJECT_HANDLE) -> Option<StorageLocation> {
        if self.public.contains_key(&handle) {
            Some(StorageLocation::TokenPublic)
        } else if self.private.contains_key(&handle) {
            Some(StorageLocation::TokenPrivate)
        } else {
            None
        }
    }

    pub(crate) fn clear(&mut self) {
        self.public.clear();
        self.private.clear();
    }
}

/// Read and check the two attributes every creation template carries.
///
/// Returns whether the object goes to the token.
pub(crate) fn creation_scope(template: &Attributes) -> ModuleResult<bool> {
    template.get_class()?;
    template.get_required(CKA_TOKEN)?.as_bool()
}

/// Create a session object; only certificates can live in a session.
pub(crate) fn create_session_object(
    session: &mut Session,
    template: &Attributes,
    handle: CK_OBJECT_HANDLE,
) -> ModuleResult<CK_OBJECT_HANDLE> {
    if template.get_class()? != CKO_CERTIFICATE {
        return Err(ModuleError::TemplateInconsistent(
            "creating session objects other than certificates is not supported".to_owned(),
        ));
    }
    if template.position(CKA_CERTIFICATE_TYPE).is_none() {
        return Err(ModuleError::TemplateIncomplete(format!(
            "{} not found in template",
            attribute_name(CKA_CERTIFICATE_TYPE)
        )));
    }
    let mut object = Object::from_template(template)?;
    if !matches!(object.kind(), ObjectKind::Certificate(_)) {
        return Err(ModuleError::TemplateInconsistent(format!(
            "unexpected {} object",
            object.kind()
        )));
    }
    object.populate_derived_attributes();
    object.set_handle(handle);
    debug!(
        "session {} now owns object {handle}",
        session.handle()
    );
    session.add_object(object);
    Ok(handle)
}

/// Ask the token to persist a new object, then store it in memory.
pub(crate) fn create_token_object(
    token: &mut dyn Token,
    objects: &mut TokenObjects,
    template: &Attributes,
    handle: CK_OBJECT_HANDLE,
) -> ModuleResult<CK_OBJECT_HANDLE> {
    token.validate()?;
    let mut object = with_device_recovery(token, |token| token.create_object(template))?;
    if !object.is_token() {
        warn!("token returned a session object, storing it as a token object anyway");
    }
    object.set_handle(handle);
    objects.insert(object);
    Ok(handle)
}
