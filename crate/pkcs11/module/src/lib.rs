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

//! PKCS#11 object management.
//!
//! The crate keeps the objects of a Cryptoki module in memory: session
//! objects owned by a session, and token objects mirrored from the tokens
//! inserted in the slots. Token access goes through the [`traits::Token`]
//! trait; the [`pkcs11`] module exports the object functions of the C API.

#![allow(non_snake_case)]
#![allow(clippy::missing_safety_doc)]
#![deny(unsafe_op_in_unsafe_fn)]
//avoid renaming all unused parameters with _ in all unused functions
#![allow(unused_variables)]

pub mod access;
pub mod config;
pub mod context;
pub mod core;
mod error;
pub mod logging;
pub mod objects_store;
pub mod pkcs11;
pub mod sessions;
pub mod slots;
mod synchronization;
pub mod traits;


pub use context::{AttributeRequest, Pkcs11Context};
pub use error::{MResultHelper, ModuleError, ModuleResult};
pub use pkcs11_sys::{CK_FUNCTION_LIST_PTR_PTR, CK_RV, CKR_OK};
