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

use std::cmp;

use indexmap::IndexMap;
use pkcs11_sys::{CK_FLAGS, CK_OBJECT_HANDLE, CK_SESSION_HANDLE, CK_SLOT_ID, CKF_RW_SESSION};
use tracing::{debug, info, trace};

use crate::{
    ModuleError, ModuleResult,
    core::{attribute::Attributes, object::Object},
    objects_store::{ObjectMap, TokenObjects},
};

/// The state of a `C_FindObjects` search.
#[derive(Debug, Default)]
pub struct SearchState {
    /// Matching handles, in scan order.
    handles: Vec<CK_OBJECT_HANDLE>,
    /// Handles already returned.
    collected: usize,
    active: bool,
}

impl SearchState {
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.handles.len() - self.collected
    }

    fn start(&mut self, handles: Vec<CK_OBJECT_HANDLE>) {
        self.handles = handles;
        self.collected = 0;
        self.active = true;
    }

    fn next(&mut self, max_count: usize) -> &[CK_OBJECT_HANDLE] {
        let start = self.collected;
        let count = cmp::min(max_count, self.remaining());
        self.collected += count;
        &self.handles[start..start + count]
    }

    fn finish(&mut self) {
        self.handles = Vec::new();
        self.collected = 0;
        self.active = false;
    }
}

#[derive(Debug)]
pub struct Session {
    handle: CK_SESSION_HANDLE,
    slot_id: CK_SLOT_ID,
    flags: CK_FLAGS,
    objects: ObjectMap,
    search: SearchState,
}

impl Session {
    pub(crate) fn new(handle: CK_SESSION_HANDLE, slot_id: CK_SLOT_ID, flags: CK_FLAGS) -> Self {
        Self {
            handle,
            slot_id,
            flags,
            objects: IndexMap::new(),
            search: SearchState::default(),
        }
    }

    #[must_use]
    pub const fn handle(&self) -> CK_SESSION_HANDLE {
        self.handle
    }

    #[must_use]
    pub const fn slot_id(&self) -> CK_SLOT_ID {
        self.slot_id
    }

    #[must_use]
    pub const fn flags(&self) -> CK_FLAGS {
        self.flags
    }

    #[must_use]
    pub const fn is_read_write(&self) -> bool {
        self.flags & CKF_RW_SESSION != 0
    }

    pub fn objects(&self) -> impl Iterator<Item = &Object> {
        self.objects.values()
    }

    #[must_use]
    pub fn find_object(&self, handle: CK_OBJECT_HANDLE) -> Option<&Object> {
        self.objects.get(&handle)
    }

    pub(crate) fn find_object_mut(&mut self, handle: CK_OBJECT_HANDLE) -> Option<&mut Object> {
        self.objects.get_mut(&handle)
    }

    pub(crate) fn add_object(&mut self, object: Object) {
        self.objects.insert(object.handle(), object);
    }

    pub(crate) fn remove_object(&mut self, handle: CK_OBJECT_HANDLE) -> Option<Object> {
        self.objects.shift_remove(&handle)
    }

    #[must_use]
    pub const fn search(&self) -> &SearchState {
        &self.search
    }

    /// Collect the handles matching `template`: this session's objects, then
    /// the public token objects, then the private ones when `include_private`
    /// is set.
    ///
    /// A search already in progress is finalized first.
    pub(crate) fn find_objects_init(
        &mut self,
        token_objects: Option<&TokenObjects>,
        include_private: bool,
        template: &Attributes,
    ) {
        if self.search.is_active() {
            debug!(
                "session {}: finalizing the previous search",
                self.handle
            );
            self.find_objects_final();
        }

        let mut handles: Vec<CK_OBJECT_HANDLE> = self
            .objects
            .values()
            .filter(|object| object.matches(template))
            .map(Object::handle)
            .collect();
        if let Some(token_objects) = token_objects {
            handles.extend(
                token_objects
                    .public()
                    .filter(|object| object.matches(template))
                    .map(Object::handle),
            );
            if include_private {
                handles.extend(
                    token_objects
                        .private()
                        .filter(|object| object.matches(template))
                        .map(Object::handle),
                );
            }
        }
        info!(
            "session {}: {} object(s) match the search template",
            self.handle,
            handles.len()
        );
        self.search.start(handles);
    }

    /// Return up to `max_count` further handles. Without an active search,
    /// nothing is returned.
    pub(crate) fn find_objects(&mut self, max_count: usize) -> Vec<CK_OBJECT_HANDLE> {
        if !self.search.is_active() {
            trace!("session {}: no active search", self.handle);
            return Vec::new();
        }
        let handles = self.search.next(max_count).to_vec();
        trace!(
            "session {}: returning {:?}, {} left of {}",
            self.handle,
            handles,
            self.search.remaining(),
            self.search.total()
        );
        handles
    }

    pub(crate) fn find_objects_final(&mut self) {
        self.search.finish();
    }
}

/// The open sessions, keyed by handle.
#[derive(Debug)]
pub struct Sessions {
    sessions: IndexMap<CK_SESSION_HANDLE, Session>,
    // "Valid session handles in Cryptoki always have nonzero values."
    next_handle: CK_SESSION_HANDLE,
}

impl Default for Sessions {
    fn default() -> Self {
        Self {
            sessions: IndexMap::new(),
            next_handle: 1,
        }
    }
}

impl Sessions {
    pub(crate) fn open(&mut self, slot_id: CK_SLOT_ID, flags: CK_FLAGS) -> CK_SESSION_HANDLE {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.sessions
            .insert(handle, Session::new(handle, slot_id, flags));
        handle
    }

    /// Close a session, dropping its objects and search state.
    pub(crate) fn close(&mut self, handle: CK_SESSION_HANDLE) -> ModuleResult<()> {
        self.sessions
            .shift_remove(&handle)
            .map(|_| ())
            .ok_or(ModuleError::SessionHandleInvalid(handle))
    }

    /// Close every session of a slot, returning how many were closed.
    pub(crate) fn close_all(&mut self, slot_id: CK_SLOT_ID) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| session.slot_id != slot_id);
        before - self.sessions.len()
    }

    pub fn get(&self, handle: CK_SESSION_HANDLE) -> ModuleResult<&Session> {
        self.sessions
            .get(&handle)
            .ok_or(ModuleError::SessionHandleInvalid(handle))
    }

    pub(crate) fn get_mut(&mut self, handle: CK_SESSION_HANDLE) -> ModuleResult<&mut Session> {
        self.sessions
            .get_mut(&handle)
            .ok_or(ModuleError::SessionHandleInvalid(handle))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use pkcs11_sys::{
        CKA_CERTIFICATE_TYPE, CKA_CLASS, CKA_LABEL, CKA_TOKEN, CKC_X_509, CKF_SERIAL_SESSION,
        CKO_CERTIFICATE,
    };

    use super::*;
    use crate::core::attribute::Attribute;

    fn certificate(handle: CK_OBJECT_HANDLE, label: &str) -> Object {
        let template: Attributes = vec![
            Attribute::from_ulong(CKA_CLASS, CKO_CERTIFICATE),
            Attribute::from_bool(CKA_TOKEN, false),
            Attribute::from_ulong(CKA_CERTIFICATE_TYPE, CKC_X_509),
            Attribute::new(CKA_LABEL, label.as_bytes()),
        ]
        .into();
        let mut object = Object::from_template(&template).unwrap();
        object.set_handle(handle);
        object
    }

    #[test]
    fn search_is_drained_incrementally() {
        let mut session = Session::new(1, 0, CKF_SERIAL_SESSION);
        for handle in 1..=3 {
            session.add_object(certificate(handle, "cert"));
        }
        session.add_object(certificate(4, "other"));

        // no search started yet
        assert!(session.find_objects(10).is_empty());

        let template: Attributes = vec![Attribute::new(CKA_LABEL, b"cert")].into();
        session.find_objects_init(None, false, &template);
        assert_eq!(session.search().total(), 3);
        assert!(session.find_objects(0).is_empty());
        assert_eq!(session.find_objects(1), vec![1]);
        assert_eq!(session.find_objects(1), vec![2]);
        assert_eq!(session.find_objects(5), vec![3]);
        assert!(session.find_objects(1).is_empty());

        session.find_objects_final();
        session.find_objects_final();
        assert!(!session.search().is_active());
        assert!(session.find_objects(1).is_empty());
    }

    #[test]
    fn init_restarts_an_active_search() {
        let mut session = Session::new(1, 0, CKF_SERIAL_SESSION);
        session.add_object(certificate(7, "a"));
        session.add_object(certificate(8, "b"));
        session.find_objects_init(None, false, &Attributes::default());
        assert_eq!(session.find_objects(1), vec![7]);
        session.find_objects_init(None, false, &Attributes::default());
        assert_eq!(session.find_objects(10), vec![7, 8]);
    }

    #[test]
    fn session_pool() {
        let mut sessions = Sessions::default();
        let first = sessions.open(1, CKF_SERIAL_SESSION);
        let second = sessions.open(1, CKF_SERIAL_SESSION);
        let third = sessions.open(2, CKF_SERIAL_SESSION);
        assert_eq!((first, second, third), (1, 2, 3));
        assert!(!sessions.get(first).unwrap().is_read_write());

        sessions.close(second).unwrap();
        assert!(matches!(
            sessions.close(second),
            Err(ModuleError::SessionHandleInvalid(2))
        ));
        assert_eq!(sessions.close_all(1), 1);
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions.get(third).unwrap().slot_id(), 2);
    }
}
