//! Keeping the token in step with the objects held in memory.
//!
//! Attribute updates are fully validated before anything is sent to the
//! token or changed in memory. Once applied, modified token objects are
//! flagged dirty and pushed to the token by [`synchronize_token`].

use pkcs11_sys::{CK_OBJECT_HANDLE, CKA_CLASS, CKA_PRIVATE, CKA_SENSITIVE, CKA_TOKEN};
use tracing::{debug, warn};

use crate::{
    ModuleError, ModuleResult,
    access::{self, AuthState},
    core::{
        attribute::{AttributeType, Attributes},
        object::Object,
    },
    objects_store::TokenObjects,
    traits::Token,
};

/// Run a token operation; on a device error, let the token recover once and
/// report the error.
pub(crate) fn with_device_recovery<T, F>(token: &mut dyn Token, f: F) -> ModuleResult<T>
where
    F: FnOnce(&mut dyn Token) -> ModuleResult<T>,
{
    match f(&mut *token) {
        Err(ModuleError::DeviceError(reason)) => {
            warn!("device error: {reason}, resetting the token");
            token.handle_device_error();
            Err(ModuleError::DeviceError(reason))
        }
        other => other,
    }
}

/// Push every dirty object of the token and clear its dirty flag.
pub(crate) fn synchronize_token(
    token: &mut dyn Token,
    objects: &mut TokenObjects,
) -> ModuleResult<()> {
    for object in objects.iter_mut().filter(|object| object.is_dirty()) {
        debug!("synchronizing object {}", object.handle());
        with_device_recovery(token, |token| token.synchronize_object(object))
            .map_err(|e| ModuleError::SynchronizationFailed(Box::new(e)))?;
        object.clear_dirty();
    }
    Ok(())
}

/// Check that `template` can be applied to `object`.
///
/// Returns whether the update makes a public object private.
pub(crate) fn validate_update(object: &Object, template: &Attributes) -> ModuleResult<bool> {
    let mut make_private = false;
    for requested in template.iter() {
        let type_ = requested.type_();
        if type_ == CKA_CLASS || type_ == CKA_TOKEN {
            return Err(ModuleError::AttributeReadOnly(type_));
        }
        let current = object.attribute(type_).ok_or_else(|| {
            ModuleError::TemplateIncomplete(format!(
                "object {} has no attribute {}",
                object.handle(),
                crate::core::attribute::attribute_name(type_)
            ))
        })?;
        if let Some(size) = AttributeType::try_from(type_)
            .ok()
            .and_then(AttributeType::fixed_size)
        {
            requested.validate(size)?;
        }
        if type_ == CKA_SENSITIVE && current.as_bool()? && !requested.as_bool()? {
            return Err(ModuleError::AttributeReadOnly(type_));
        }
        if type_ == CKA_PRIVATE {
            match (current.as_bool()?, requested.as_bool()?) {
                (true, false) => {
                    return Err(ModuleError::TemplateInconsistent(format!(
                        "object {} cannot be made public again",
                        object.handle()
                    )));
                }
                (false, true) => make_private = true,
                _ => {}
            }
        }
    }
    Ok(make_private)
}

/// Write the non `CKA_PRIVATE` values of a validated template.
fn apply_update(object: &mut Object, template: &Attributes) -> ModuleResult<()> {
    for requested in template.iter().filter(|a| a.type_() != CKA_PRIVATE) {
        object.update_attribute(requested)?;
    }
    Ok(())
}

/// Update a session object; it has no persistent counterpart.
pub(crate) fn set_session_object_attributes(
    object: &mut Object,
    template: &Attributes,
) -> ModuleResult<()> {
    let make_private = validate_update(object, template)?;
    apply_update(object, template)?;
    if make_private {
        object.make_private();
    }
    Ok(())
}

/// Update a token object, on the token first, then in memory, then
/// resynchronize the token.
///
/// Turning a public object private removes the public copy from the token
/// and moves the object to the private collection under the same handle.
pub(crate) fn set_token_object_attributes(
    token: &mut dyn Token,
    objects: &mut TokenObjects,
    state: AuthState,
    handle: CK_OBJECT_HANDLE,
    template: &Attributes,
) -> ModuleResult<()> {
    let object = objects
        .find(handle, !state.is_user())
        .ok_or(ModuleError::ObjectHandleInvalid(handle))?;
    if !access::can_modify(state, object) {
        return Err(ModuleError::ObjectHandleInvalid(handle));
    }
    token.validate()?;
    let make_private = validate_update(object, template)?;

    match with_device_recovery(token, |token| {
        token.set_object_attributes(object, template)
    }) {
        Ok(()) => {}
        Err(ModuleError::FunctionNotSupported) => {
            debug!("token has no in-place update, changes are written on synchronization");
        }
        Err(e) => return Err(e),
    }
    if make_private {
        with_device_recovery(token, |token| token.destroy_object(object))?;
    }

    let object = objects
        .find_mut(handle, false)
        .ok_or(ModuleError::ObjectHandleInvalid(handle))?;
    apply_update(object, template)?;
    if make_private {
        objects.relocate_to_private(handle)?;
    }
    synchronize_token(token, objects)
}

/// Remove a token object from the token, then from memory, then
/// resynchronize the token.
pub(crate) fn destroy_token_object(
    token: &mut dyn Token,
    objects: &mut TokenObjects,
    handle: CK_OBJECT_HANDLE,
) -> ModuleResult<()> {
    let object = objects
        .find(handle, false)
        .ok_or(ModuleError::ObjectHandleInvalid(handle))?;
    token.validate()?;
    with_device_recovery(token, |token| token.destroy_object(object))?;
    objects.remove(handle);
    synchronize_token(token, objects)
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use pkcs11_sys::{CKA_LABEL, CKA_VALUE, CKO_DATA, CKR_DEVICE_ERROR, CK_RV};

    use super::*;
    use crate::core::attribute::Attribute;

    #[derive(Default)]
    struct FlakyToken {
        fail_with: Option<fn() -> ModuleError>,
        resets: usize,
        synchronized: Vec<CK_OBJECT_HANDLE>,
    }

    impl Token for FlakyToken {
        fn validate(&self) -> ModuleResult<()> {
            Ok(())
        }

        fn is_user_logged_in(&self) -> bool {
            true
        }

        fn create_object(&mut self, template: &Attributes) -> ModuleResult<Object> {
            Object::from_template(template)
        }

        fn destroy_object(&mut self, _object: &Object) -> ModuleResult<()> {
            Ok(())
        }

        fn set_object_attributes(
            &mut self,
            _object: &Object,
            _template: &Attributes,
        ) -> ModuleResult<()> {
            Err(ModuleError::FunctionNotSupported)
        }

        fn synchronize_object(&mut self, object: &Object) -> ModuleResult<()> {
            if let Some(fail_with) = self.fail_with {
                return Err(fail_with());
            }
            self.synchronized.push(object.handle());
            Ok(())
        }

        fn handle_device_error(&mut self) {
            self.resets += 1;
        }
    }

    fn token_objects() -> TokenObjects {
        let mut objects = TokenObjects::default();
        for handle in 1..=2 {
            let template: Attributes = vec![
                Attribute::from_ulong(CKA_CLASS, CKO_DATA),
                Attribute::from_bool(CKA_TOKEN, true),
                Attribute::from_bool(CKA_PRIVATE, false),
                Attribute::new(CKA_LABEL, b"label"),
            ]
            .into();
            let mut object = Object::from_template(&template).unwrap();
            object.set_handle(handle);
            objects.insert(object);
        }
        objects
    }

    #[test]
    fn validation_rejects_before_anything_changes() {
        let objects = token_objects();
        let object = objects.find(1, false).unwrap();

        let read_only: Attributes = vec![Attribute::from_ulong(CKA_CLASS, CKO_DATA)].into();
        assert!(matches!(
            validate_update(object, &read_only),
            Err(ModuleError::AttributeReadOnly(CKA_CLASS))
        ));
        let missing: Attributes = vec![Attribute::new(CKA_VALUE, b"v")].into();
        assert!(matches!(
            validate_update(object, &missing),
            Err(ModuleError::TemplateIncomplete(_))
        ));
        let too_wide: Attributes = vec![Attribute::new(CKA_PRIVATE, &[1, 0])].into();
        assert!(matches!(
            validate_update(object, &too_wide),
            Err(ModuleError::AttributeValueInvalid(CKA_PRIVATE))
        ));
        let private: Attributes = vec![Attribute::from_bool(CKA_PRIVATE, true)].into();
        assert!(validate_update(object, &private).unwrap());
        let unchanged: Attributes = vec![Attribute::from_bool(CKA_PRIVATE, false)].into();
        assert!(!validate_update(object, &unchanged).unwrap());
    }

    #[test]
    fn sensitive_objects_stay_sensitive() {
        let template: Attributes = vec![
            Attribute::from_ulong(CKA_CLASS, CKO_DATA),
            Attribute::from_bool(CKA_TOKEN, true),
            Attribute::from_bool(CKA_SENSITIVE, true),
            Attribute::new(CKA_VALUE, b"secret"),
        ]
        .into();
        let mut object = Object::from_template(&template).unwrap();
        object.set_handle(3);

        let clear: Attributes = vec![Attribute::from_bool(CKA_SENSITIVE, false)].into();
        assert!(matches!(
            validate_update(&object, &clear),
            Err(ModuleError::AttributeReadOnly(CKA_SENSITIVE))
        ));
        assert!(matches!(
            object.update_attribute(&Attribute::from_bool(CKA_SENSITIVE, false)),
            Err(ModuleError::AttributeReadOnly(CKA_SENSITIVE))
        ));
        assert!(object.is_sensitive());
        assert!(object.attribute(CKA_SENSITIVE).unwrap().as_bool().unwrap());

        let keep: Attributes = vec![Attribute::from_bool(CKA_SENSITIVE, true)].into();
        assert!(!validate_update(&object, &keep).unwrap());
    }

    #[test]
    fn dirty_objects_are_pushed_once() {
        let mut token = FlakyToken::default();
        let mut objects = token_objects();
        let template: Attributes = vec![Attribute::new(CKA_LABEL, b"renamed")].into();
        set_token_object_attributes(
            &mut token,
            &mut objects,
            AuthState::ReadWriteUser,
            2,
            &template,
        )
        .unwrap();
        assert_eq!(token.synchronized, vec![2]);
        assert!(!objects.find(2, false).unwrap().is_dirty());

        synchronize_token(&mut token, &mut objects).unwrap();
        assert_eq!(token.synchronized, vec![2]);
    }

    #[test]
    fn device_errors_reset_the_token_once() {
        let mut token = FlakyToken {
            fail_with: Some(|| ModuleError::DeviceError("card removed".to_owned())),
            ..FlakyToken::default()
        };
        let mut objects = token_objects();
        let template: Attributes = vec![Attribute::new(CKA_LABEL, b"renamed")].into();
        let err = set_token_object_attributes(
            &mut token,
            &mut objects,
            AuthState::ReadWriteUser,
            1,
            &template,
        )
        .unwrap_err();
        assert!(matches!(err, ModuleError::SynchronizationFailed(_)));
        assert_eq!(CK_RV::from(err), CKR_DEVICE_ERROR);
        assert_eq!(token.resets, 1);
        // the in-memory update stays applied and pending
        let object = objects.find(1, false).unwrap();
        assert_eq!(object.attribute(CKA_LABEL).unwrap().value(), b"renamed");
        assert!(object.is_dirty());
    }

    #[test]
    fn read_only_users_cannot_touch_token_objects() {
        let mut token = FlakyToken::default();
        let mut objects = token_objects();
        let template: Attributes = vec![Attribute::new(CKA_LABEL, b"renamed")].into();
        assert!(matches!(
            set_token_object_attributes(
                &mut token,
                &mut objects,
                AuthState::ReadOnlyUser,
                1,
                &template,
            ),
            Err(ModuleError::ObjectHandleInvalid(1))
        ));
        assert_eq!(
            objects.find(1, false).unwrap().attribute(CKA_LABEL).unwrap().value(),
            b"label"
        );
    }
}
