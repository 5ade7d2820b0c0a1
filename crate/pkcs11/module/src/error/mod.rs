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

use std::sync::PoisonError;

use pkcs11_sys::{
    CK_ATTRIBUTE_TYPE, CK_OBJECT_HANDLE, CK_RV, CK_SESSION_HANDLE, CK_SLOT_ID, CKR_ARGUMENTS_BAD,
    CKR_ATTRIBUTE_READ_ONLY, CKR_ATTRIBUTE_SENSITIVE, CKR_ATTRIBUTE_TYPE_INVALID,
    CKR_ATTRIBUTE_VALUE_INVALID, CKR_BUFFER_TOO_SMALL, CKR_CRYPTOKI_ALREADY_INITIALIZED,
    CKR_CRYPTOKI_NOT_INITIALIZED, CKR_DEVICE_ERROR, CKR_FUNCTION_FAILED, CKR_FUNCTION_NOT_SUPPORTED,
    CKR_GENERAL_ERROR,
    CKR_HOST_MEMORY, CKR_OBJECT_HANDLE_INVALID, CKR_SESSION_HANDLE_INVALID,
    CKR_SESSION_PARALLEL_NOT_SUPPORTED, CKR_SESSION_READ_ONLY, CKR_SLOT_ID_INVALID,
    CKR_TEMPLATE_INCOMPLETE, CKR_TEMPLATE_INCONSISTENT, CKR_TOKEN_NOT_PRESENT,
};
use thiserror::Error;

use crate::core::attribute::attribute_name;

pub(crate) mod result;
pub use result::{MResultHelper, ModuleResult};

#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("pkcs11 error: {0}")]
    Default(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<ModuleError>,
    },

    // Cryptoki errors.
    #[error("bad arguments: {0}")]
    BadArguments(String),
    #[error("{} is not a valid attribute type for this object", attribute_name(*.0))]
    AttributeTypeInvalid(CK_ATTRIBUTE_TYPE),
    #[error("the value for attribute {} is invalid", attribute_name(*.0))]
    AttributeValueInvalid(CK_ATTRIBUTE_TYPE),
    #[error("attribute {} is sensitive and cannot be revealed", attribute_name(*.0))]
    AttributeSensitive(CK_ATTRIBUTE_TYPE),
    #[error("attribute {} cannot be modified", attribute_name(*.0))]
    AttributeReadOnly(CK_ATTRIBUTE_TYPE),
    #[error("buffer too small")]
    BufferTooSmall,
    #[error("cryptoki module has already been initialized")]
    CryptokiAlreadyInitialized,
    #[error("cryptoki module has not been initialized")]
    CryptokiNotInitialized,
    #[error("function not supported")]
    FunctionNotSupported,
    #[error("out of memory")]
    HostMemory,
    #[error("object {0} is invalid")]
    ObjectHandleInvalid(CK_OBJECT_HANDLE),
    #[error("session handle {0} is invalid")]
    SessionHandleInvalid(CK_SESSION_HANDLE),
    #[error("token does not support parallel sessions")]
    SessionParallelNotSupported,
    #[error("session {0} is read only")]
    SessionReadOnly(CK_SESSION_HANDLE),
    #[error("slot id {0} is invalid")]
    SlotIdInvalid(CK_SLOT_ID),
    #[error("template incomplete: {0}")]
    TemplateIncomplete(String),
    #[error("template inconsistent: {0}")]
    TemplateInconsistent(String),
    #[error("no token present in slot {0}")]
    TokenNotPresent(CK_SLOT_ID),
    #[error("slot {0} already holds a token")]
    TokenAlreadyPresent(CK_SLOT_ID),

    // Token collaborator errors.
    #[error("device error: {0}")]
    DeviceError(String),
    #[error("token synchronization failed: {0}")]
    SynchronizationFailed(#[source] Box<ModuleError>),

    // Other errors.
    #[error(transparent)]
    Serialization(#[from] bincode::Error),
    #[error(transparent)]
    TryFromInt(#[from] std::num::TryFromIntError),
    #[error(transparent)]
    TryFromSlice(#[from] std::array::TryFromSliceError),
}

impl From<std::convert::Infallible> for ModuleError {
    fn from(e: std::convert::Infallible) -> Self {
        match e {}
    }
}

impl<T> From<PoisonError<T>> for ModuleError {
    fn from(e: PoisonError<T>) -> Self {
        Self::Default(format!("lock poisoned: {e}"))
    }
}

impl From<ModuleError> for CK_RV {
    fn from(e: ModuleError) -> Self {
        match e {
            ModuleError::Context { source, .. } | ModuleError::SynchronizationFailed(source) => {
                (*source).into()
            }
            ModuleError::BadArguments(_) => CKR_ARGUMENTS_BAD,
            ModuleError::AttributeTypeInvalid(_) => CKR_ATTRIBUTE_TYPE_INVALID,
            ModuleError::AttributeValueInvalid(_) => CKR_ATTRIBUTE_VALUE_INVALID,
            ModuleError::AttributeSensitive(_) => CKR_ATTRIBUTE_SENSITIVE,
            ModuleError::AttributeReadOnly(_) => CKR_ATTRIBUTE_READ_ONLY,
            ModuleError::BufferTooSmall => CKR_BUFFER_TOO_SMALL,
            ModuleError::CryptokiAlreadyInitialized => CKR_CRYPTOKI_ALREADY_INITIALIZED,
            ModuleError::CryptokiNotInitialized => CKR_CRYPTOKI_NOT_INITIALIZED,
            ModuleError::DeviceError(_) => CKR_DEVICE_ERROR,
            ModuleError::FunctionNotSupported => CKR_FUNCTION_NOT_SUPPORTED,
            ModuleError::HostMemory => CKR_HOST_MEMORY,
            ModuleError::ObjectHandleInvalid(_) => CKR_OBJECT_HANDLE_INVALID,
            ModuleError::SessionHandleInvalid(_) => CKR_SESSION_HANDLE_INVALID,
            ModuleError::SessionParallelNotSupported => CKR_SESSION_PARALLEL_NOT_SUPPORTED,
            ModuleError::SessionReadOnly(_) => CKR_SESSION_READ_ONLY,
            ModuleError::SlotIdInvalid(_) => CKR_SLOT_ID_INVALID,
            ModuleError::TemplateIncomplete(_) => CKR_TEMPLATE_INCOMPLETE,
            ModuleError::TemplateInconsistent(_) => CKR_TEMPLATE_INCONSISTENT,
            ModuleError::TokenNotPresent(_) => CKR_TOKEN_NOT_PRESENT,
            ModuleError::TokenAlreadyPresent(_) => CKR_FUNCTION_FAILED,

            ModuleError::Default(_)
            | ModuleError::Serialization(_)
            | ModuleError::TryFromInt(_)
            | ModuleError::TryFromSlice(_) => CKR_GENERAL_ERROR,
        }
    }
}
