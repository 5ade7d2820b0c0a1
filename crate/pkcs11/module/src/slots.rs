use pkcs11_sys::{CK_OBJECT_HANDLE, CK_SLOT_ID};
use tracing::{debug, info};

use crate::{
    ModuleError, ModuleResult,
    core::object::Object,
    objects_store::{HandleAllocator, TokenObjects},
    synchronization::with_device_recovery,
    traits::Token,
};

/// A reader slot: the token inserted in it, if any, and the token objects
/// known in memory.
pub struct Slot {
    id: CK_SLOT_ID,
    token: Option<Box<dyn Token>>,
    objects: TokenObjects,
}

impl Slot {
    #[must_use]
    pub fn new(id: CK_SLOT_ID) -> Self {
        Self {
            id,
            token: None,
            objects: TokenObjects::default(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> CK_SLOT_ID {
        self.id
    }

    #[must_use]
    pub const fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// Whether a token is present and its user logged in.
    #[must_use]
    pub fn is_user_logged_in(&self) -> bool {
        self.token
            .as_ref()
            .is_some_and(|token| token.is_user_logged_in())
    }

    /// The token objects, `None` when no token is present.
    #[must_use]
    pub fn objects(&self) -> Option<&TokenObjects> {
        self.token.as_ref().map(|_| &self.objects)
    }

    /// The token and its objects, borrowed together.
    pub(crate) fn token_and_objects(
        &mut self,
    ) -> ModuleResult<(&mut dyn Token, &mut TokenObjects)> {
        let token: &mut dyn Token = self
            .token
            .as_deref_mut()
            .ok_or(ModuleError::TokenNotPresent(self.id))?;
        Ok((token, &mut self.objects))
    }

    /// Install a token in an empty slot and load the objects it already
    /// holds, giving each a fresh handle.
    pub(crate) fn insert_token(
        &mut self,
        mut token: Box<dyn Token>,
        handles: &mut HandleAllocator,
    ) -> ModuleResult<()> {
        if self.token.is_some() {
            return Err(ModuleError::TokenAlreadyPresent(self.id));
        }
        let loaded = with_device_recovery(&mut *token, |token| token.load_objects())?;
        self.objects.clear();
        for mut object in loaded {
            object.set_handle(handles.allocate());
            object.clear_dirty();
            self.objects.insert(object);
        }
        info!(
            "slot {}: token registered with {} object(s)",
            self.id,
            self.objects.len()
        );
        self.token = Some(token);
        Ok(())
    }

    /// Remove the token and forget its objects; returns the dropped handles.
    pub(crate) fn remove_token(&mut self) -> ModuleResult<Vec<CK_OBJECT_HANDLE>> {
        if self.token.take().is_none() {
            return Err(ModuleError::TokenNotPresent(self.id));
        }
        let handles = self
            .objects
            .public()
            .chain(self.objects.private())
            .map(Object::handle)
            .collect();
        self.objects.clear();
        debug!("slot {}: token removed", self.id);
        Ok(handles)
    }
}
