//! Who may see and change which object.
//!
//! The authentication state is never stored: it is derived on each call from
//! the session flags and the login state of the token.

use pkcs11_sys::{
    CK_FLAGS, CK_STATE, CKF_RW_SESSION, CKS_RO_PUBLIC_SESSION, CKS_RO_USER_FUNCTIONS,
    CKS_RW_PUBLIC_SESSION, CKS_RW_USER_FUNCTIONS,
};
use strum_macros::Display;

use crate::core::object::Object;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Anonymous,
    ReadOnlyUser,
    ReadWriteUser,
}

impl AuthState {
    #[must_use]
    pub const fn derive(session_flags: CK_FLAGS, user_logged_in: bool) -> Self {
        if !user_logged_in {
            Self::Anonymous
        } else if session_flags & CKF_RW_SESSION != 0 {
            Self::ReadWriteUser
        } else {
            Self::ReadOnlyUser
        }
    }

    /// Whether the user PIN grants access to private objects.
    #[must_use]
    pub const fn is_user(self) -> bool {
        matches!(self, Self::ReadOnlyUser | Self::ReadWriteUser)
    }

    /// The Cryptoki session state for these session flags.
    #[must_use]
    pub const fn session_state(self, session_flags: CK_FLAGS) -> CK_STATE {
        match self {
            Self::Anonymous if session_flags & CKF_RW_SESSION != 0 => CKS_RW_PUBLIC_SESSION,
            Self::Anonymous => CKS_RO_PUBLIC_SESSION,
            Self::ReadOnlyUser => CKS_RO_USER_FUNCTIONS,
            Self::ReadWriteUser => CKS_RW_USER_FUNCTIONS,
        }
    }
}

/// Reading token objects: public ones, or any once the user is in.
#[must_use]
pub const fn can_read(state: AuthState, object: &Object) -> bool {
    object.is_public() || state.is_user()
}

/// Changing attributes: own session objects always, token objects only for a
/// read/write user.
#[must_use]
pub const fn can_modify(state: AuthState, object: &Object) -> bool {
    !object.is_token() || matches!(state, AuthState::ReadWriteUser)
}

/// Destroying: session objects and public token objects always, private
/// token objects only for a read/write user.
#[must_use]
pub const fn can_destroy(state: AuthState, object: &Object) -> bool {
    !object.is_token() || object.is_public() || matches!(state, AuthState::ReadWriteUser)
}

#[must_use]
pub const fn can_create_token_object(state: AuthState) -> bool {
    matches!(state, AuthState::ReadWriteUser)
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use pkcs11_sys::{CKA_CLASS, CKA_PRIVATE, CKA_TOKEN, CKF_SERIAL_SESSION, CKO_DATA};

    use super::*;
    use crate::core::attribute::{Attribute, Attributes};

    fn object(token: bool, private: bool) -> Object {
        let template: Attributes = vec![
            Attribute::from_ulong(CKA_CLASS, CKO_DATA),
            Attribute::from_bool(CKA_TOKEN, token),
            Attribute::from_bool(CKA_PRIVATE, private),
        ]
        .into();
        Object::from_template(&template).unwrap()
    }

    #[test]
    fn state_derivation() {
        let rw = CKF_SERIAL_SESSION | CKF_RW_SESSION;
        assert_eq!(AuthState::derive(rw, false), AuthState::Anonymous);
        assert_eq!(
            AuthState::derive(CKF_SERIAL_SESSION, true),
            AuthState::ReadOnlyUser
        );
        assert_eq!(AuthState::derive(rw, true), AuthState::ReadWriteUser);

        assert_eq!(
            AuthState::Anonymous.session_state(rw),
            CKS_RW_PUBLIC_SESSION
        );
        assert_eq!(
            AuthState::Anonymous.session_state(CKF_SERIAL_SESSION),
            CKS_RO_PUBLIC_SESSION
        );
        assert_eq!(
            AuthState::ReadOnlyUser.session_state(CKF_SERIAL_SESSION),
            CKS_RO_USER_FUNCTIONS
        );
        assert_eq!(
            AuthState::ReadWriteUser.session_state(rw),
            CKS_RW_USER_FUNCTIONS
        );
    }

    #[test]
    fn gate() {
        let private_token = object(true, true);
        let public_token = object(true, false);
        let session = object(false, false);

        assert!(!can_read(AuthState::Anonymous, &private_token));
        assert!(can_read(AuthState::ReadOnlyUser, &private_token));
        assert!(can_read(AuthState::Anonymous, &public_token));

        assert!(can_modify(AuthState::Anonymous, &session));
        assert!(!can_modify(AuthState::ReadOnlyUser, &public_token));
        assert!(can_modify(AuthState::ReadWriteUser, &private_token));

        assert!(can_destroy(AuthState::Anonymous, &public_token));
        assert!(!can_destroy(AuthState::ReadOnlyUser, &private_token));
        assert!(can_destroy(AuthState::ReadWriteUser, &private_token));

        assert!(!can_create_token_object(AuthState::ReadOnlyUser));
        assert!(can_create_token_object(AuthState::ReadWriteUser));
    }
}
