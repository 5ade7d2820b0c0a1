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


use crate::{
    ModuleResult,
    core::{attribute::Attributes, object::Object},
};

/// The token driver behind a slot.
///
/// The object core never talks to the device itself: it asks the token to
/// persist, remove and update objects, and to report whether the user is
/// logged in. Implementations signal device level failures with
/// [`crate::ModuleError::DeviceError`].
pub trait Token: Send + Sync {
    /// Check that the token is present and usable.
    fn validate(&self) -> ModuleResult<()>;

    /// Whether the user PIN has been verified on this token.
    fn is_user_logged_in(&self) -> bool;

    /// Persist a new object described by `template`.
    ///
    /// The returned object carries the attributes the token stored; the
    /// caller assigns its handle.
    fn create_object(&mut self, template: &Attributes) -> ModuleResult<Object>;

    /// Remove a persisted object.
    fn destroy_object(&mut self, object: &Object) -> ModuleResult<()>;

    /// Push attribute changes of an object before they are applied in memory.
    ///
    /// Tokens without in-place update return
    /// [`crate::ModuleError::FunctionNotSupported`]; the changes then reach the
    /// token on the next synchronization.
    fn set_object_attributes(&mut self, object: &Object, template: &Attributes)
    -> ModuleResult<()>;

    /// Write the current state of a modified object.
    fn synchronize_object(&mut self, object: &Object) -> ModuleResult<()>;

    /// Recover after a device error, e.g. by resetting the reader connection.
    fn handle_device_error(&mut self);

    /// Objects already persisted on the token, loaded when the token is
    /// registered.
    fn load_objects(&mut self) -> ModuleResult<Vec<Object>> {
        Ok(Vec::new())
    }
}
