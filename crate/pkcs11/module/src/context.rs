//! The object management operations, over an explicit context.
//!
//! A [`Pkcs11Context`] owns the slots, the open sessions and the object
//! handle allocator. Each method implements one Cryptoki object function and
//! runs to completion; `&mut self` serializes the calls.

use std::collections::HashMap;

use pkcs11_sys::{
    CK_ATTRIBUTE_TYPE, CK_FLAGS, CK_OBJECT_HANDLE, CK_SESSION_HANDLE, CK_SLOT_ID, CK_STATE,
    CK_ULONG, CK_UNAVAILABLE_INFORMATION, CKA_VALUE, CKF_SERIAL_SESSION,
};
use tracing::{debug, info, trace};

use crate::{
    MResultHelper, ModuleError, ModuleResult,
    access::{self, AuthState},
    core::{attribute::Attributes, object::Object},
    objects_store::{self, HandleAllocator},
    sessions::{Session, Sessions},
    slots::Slot,
    synchronization,
    traits::Token,
};

/// One entry of a `GetAttributeValue` request.
///
/// `capacity` is the size of the caller's buffer, `None` when the caller only
/// asks for the length. On return `value_len` holds the length of the value,
/// or `CK_UNAVAILABLE_INFORMATION`, and `value` the bytes when they fit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeRequest {
    pub type_: CK_ATTRIBUTE_TYPE,
    pub capacity: Option<usize>,
    pub value: Option<Vec<u8>>,
    pub value_len: CK_ULONG,
}

impl AttributeRequest {
    #[must_use]
    pub const fn new(type_: CK_ATTRIBUTE_TYPE, capacity: Option<usize>) -> Self {
        Self {
            type_,
            capacity,
            value: None,
            value_len: 0,
        }
    }
}

#[derive(Default)]
pub struct Pkcs11Context {
    slots: HashMap<CK_SLOT_ID, Slot>,
    sessions: Sessions,
    handles: HandleAllocator,
}

impl Pkcs11Context {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an empty slot.
    pub fn add_slot(&mut self, slot_id: CK_SLOT_ID) {
        self.slots
            .entry(slot_id)
            .or_insert_with(|| Slot::new(slot_id));
    }

    /// Insert a token in a slot, creating the slot if needed; the objects the
    /// token already holds become visible with fresh handles.
    pub fn register_token(
        &mut self,
        slot_id: CK_SLOT_ID,
        token: Box<dyn Token>,
    ) -> ModuleResult<()> {
        let slot = self
            .slots
            .entry(slot_id)
            .or_insert_with(|| Slot::new(slot_id));
        slot.insert_token(token, &mut self.handles)
            .with_context(|| format!("registering the token of slot {slot_id}"))
    }

    /// Remove the token of a slot; its objects and the sessions opened on the
    /// slot are dropped.
    pub fn remove_token(&mut self, slot_id: CK_SLOT_ID) -> ModuleResult<()> {
        let dropped = self.slot_mut(slot_id)?.remove_token()?;
        let closed = self.sessions.close_all(slot_id);
        info!(
            "slot {slot_id}: token removed, {} object(s) and {closed} session(s) dropped",
            dropped.len()
        );
        Ok(())
    }

    pub fn open_session(
        &mut self,
        slot_id: CK_SLOT_ID,
        flags: CK_FLAGS,
    ) -> ModuleResult<CK_SESSION_HANDLE> {
        self.slot(slot_id)?;
        if flags & CKF_SERIAL_SESSION == 0 {
            return Err(ModuleError::SessionParallelNotSupported);
        }
        let handle = self.sessions.open(slot_id, flags);
        info!("slot {slot_id}: session {handle} opened with flags {flags:#x}");
        Ok(handle)
    }

    pub fn close_session(&mut self, session: CK_SESSION_HANDLE) -> ModuleResult<()> {
        self.sessions.close(session)?;
        info!("session {session} closed");
        Ok(())
    }

    pub fn close_all_sessions(&mut self, slot_id: CK_SLOT_ID) -> ModuleResult<()> {
        self.slot(slot_id)?;
        let closed = self.sessions.close_all(slot_id);
        info!("slot {slot_id}: {closed} session(s) closed");
        Ok(())
    }

    pub fn session(&self, session: CK_SESSION_HANDLE) -> ModuleResult<&Session> {
        self.sessions.get(session)
    }

    /// The authentication state of a session, from its flags and the login
    /// state of its token.
    pub fn auth_state(&self, session: CK_SESSION_HANDLE) -> ModuleResult<AuthState> {
        let session = self.sessions.get(session)?;
        let slot = self.slot(session.slot_id())?;
        Ok(AuthState::derive(session.flags(), slot.is_user_logged_in()))
    }

    /// The Cryptoki `CKS_*` state of a session.
    pub fn session_state(&self, session: CK_SESSION_HANDLE) -> ModuleResult<CK_STATE> {
        let flags = self.sessions.get(session)?.flags();
        Ok(self.auth_state(session)?.session_state(flags))
    }

    pub fn create_object(
        &mut self,
        session: CK_SESSION_HANDLE,
        template: &Attributes,
    ) -> ModuleResult<CK_OBJECT_HANDLE> {
        let state = self.auth_state(session)?;
        let on_token = objects_store::creation_scope(template)?;
        let handle = if on_token {
            if !access::can_create_token_object(state) {
                return Err(ModuleError::SessionReadOnly(session));
            }
            let slot_id = self.sessions.get(session)?.slot_id();
            let slot = self
                .slots
                .get_mut(&slot_id)
                .ok_or(ModuleError::SlotIdInvalid(slot_id))?;
            let (token, objects) = slot.token_and_objects()?;
            let handle = self.handles.allocate();
            objects_store::create_token_object(token, objects, template, handle)
                .context("creating object on token")?
        } else {
            let handle = self.handles.allocate();
            let session = self.sessions.get_mut(session)?;
            objects_store::create_session_object(session, template, handle)?
        };
        info!("session {session}: created object {handle}");
        Ok(handle)
    }

    /// Copying objects is not supported.
    pub fn copy_object(
        &mut self,
        _session: CK_SESSION_HANDLE,
        _object: CK_OBJECT_HANDLE,
        _template: &Attributes,
    ) -> ModuleResult<CK_OBJECT_HANDLE> {
        Err(ModuleError::FunctionNotSupported)
    }

    /// Destroy a session object, a public token object, or a private token
    /// object when the session belongs to a read/write user.
    pub fn destroy_object(
        &mut self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
    ) -> ModuleResult<()> {
        let state = self.auth_state(session)?;
        let session_record = self.sessions.get_mut(session)?;
        if session_record.remove_object(object).is_some() {
            debug!("session {session}: destroyed session object {object}");
            return Ok(());
        }
        let slot_id = session_record.slot_id();
        let slot = self
            .slots
            .get_mut(&slot_id)
            .ok_or(ModuleError::SlotIdInvalid(slot_id))?;
        let allowed = slot
            .objects()
            .and_then(|objects| objects.find(object, false))
            .is_some_and(|found| access::can_destroy(state, found));
        if !allowed {
            return Err(ModuleError::ObjectHandleInvalid(object));
        }
        let (token, objects) = slot.token_and_objects()?;
        synchronization::destroy_token_object(token, objects, object)?;
        debug!("session {session}: destroyed token object {object}");
        Ok(())
    }

    /// The persisted size of an object.
    pub fn get_object_size(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
    ) -> ModuleResult<u64> {
        self.readable_object(session, object)?.size()
    }

    /// Read attribute values into `requests`.
    ///
    /// Every entry is processed even when some fail; the error of the last
    /// failing entry is returned.
    pub fn get_attribute_value(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        requests: &mut [AttributeRequest],
    ) -> ModuleResult<()> {
        let object = self.readable_object(session, object)?;
        let mut result = Ok(());
        for request in requests.iter_mut() {
            if let Err(e) = read_attribute(object, request) {
                debug!("session {session}: {e}");
                result = Err(e);
            }
        }
        result
    }

    pub fn set_attribute_value(
        &mut self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
        template: &Attributes,
    ) -> ModuleResult<()> {
        let state = self.auth_state(session)?;
        let session_record = self.sessions.get_mut(session)?;
        if let Some(session_object) = session_record.find_object_mut(object) {
            return synchronization::set_session_object_attributes(session_object, template);
        }
        let slot_id = session_record.slot_id();
        let slot = self
            .slots
            .get_mut(&slot_id)
            .ok_or(ModuleError::SlotIdInvalid(slot_id))?;
        if !slot.has_token() {
            return Err(ModuleError::ObjectHandleInvalid(object));
        }
        let (token, objects) = slot.token_and_objects()?;
        synchronization::set_token_object_attributes(token, objects, state, object, template)
    }

    pub fn find_objects_init(
        &mut self,
        session: CK_SESSION_HANDLE,
        template: &Attributes,
    ) -> ModuleResult<()> {
        let state = self.auth_state(session)?;
        let session = self.sessions.get_mut(session)?;
        let slot_id = session.slot_id();
        let slot = self
            .slots
            .get(&slot_id)
            .ok_or(ModuleError::SlotIdInvalid(slot_id))?;
        session.find_objects_init(slot.objects(), state.is_user(), template);
        Ok(())
    }

    pub fn find_objects(
        &mut self,
        session: CK_SESSION_HANDLE,
        max_count: usize,
    ) -> ModuleResult<Vec<CK_OBJECT_HANDLE>> {
        Ok(self.sessions.get_mut(session)?.find_objects(max_count))
    }

    pub fn find_objects_final(&mut self, session: CK_SESSION_HANDLE) -> ModuleResult<()> {
        self.sessions.get_mut(session)?.find_objects_final();
        Ok(())
    }

    fn slot(&self, slot_id: CK_SLOT_ID) -> ModuleResult<&Slot> {
        self.slots
            .get(&slot_id)
            .ok_or(ModuleError::SlotIdInvalid(slot_id))
    }

    fn slot_mut(&mut self, slot_id: CK_SLOT_ID) -> ModuleResult<&mut Slot> {
        self.slots
            .get_mut(&slot_id)
            .ok_or(ModuleError::SlotIdInvalid(slot_id))
    }

    /// An object the session may read: its own objects first, then the
    /// token objects it is allowed to see.
    fn readable_object(
        &self,
        session: CK_SESSION_HANDLE,
        object: CK_OBJECT_HANDLE,
    ) -> ModuleResult<&Object> {
        let state = self.auth_state(session)?;
        let session = self.sessions.get(session)?;
        if let Some(own) = session.find_object(object) {
            return Ok(own);
        }
        self.slots
            .get(&session.slot_id())
            .and_then(Slot::objects)
            .and_then(|objects| objects.find(object, !state.is_user()))
            .filter(|found| access::can_read(state, found))
            .ok_or(ModuleError::ObjectHandleInvalid(object))
    }
}

fn read_attribute(object: &Object, request: &mut AttributeRequest) -> ModuleResult<()> {
    request.value = None;
    let Some(attribute) = object.attribute(request.type_) else {
        request.value_len = CK_UNAVAILABLE_INFORMATION;
        return Err(ModuleError::AttributeTypeInvalid(request.type_));
    };
    if request.type_ == CKA_VALUE && object.is_sensitive() {
        request.value_len = CK_UNAVAILABLE_INFORMATION;
        return Err(ModuleError::AttributeSensitive(request.type_));
    }
    request.value_len = CK_ULONG::try_from(attribute.len())?;
    match request.capacity {
        None => Ok(()),
        Some(capacity) if capacity < attribute.len() => Err(ModuleError::BufferTooSmall),
        Some(_) => {
            trace!("object {}: read {attribute:?}", object.handle());
            request.value = Some(attribute.value().to_vec());
            Ok(())
        }
    }
}
