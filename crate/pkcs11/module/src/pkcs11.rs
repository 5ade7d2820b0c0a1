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

//! The Cryptoki object functions, exported with the C calling convention.
//!
//! `C_Initialize` installs a process wide [`Pkcs11Context`] that every other
//! entry point locks for the duration of the call; `C_Finalize` drops it.
//! Only the object management part of Cryptoki is provided; the other slots
//! of the function list are empty.

#![allow(clippy::as_conversions)]
#![allow(clippy::significant_drop_in_scrutinee)]

use std::{ptr::addr_of_mut, slice, sync::RwLock};

use once_cell::sync::Lazy;
use pkcs11_sys::{
    CK_ATTRIBUTE, CK_ATTRIBUTE_PTR, CK_C_INITIALIZE_ARGS_PTR, CK_FLAGS, CK_FUNCTION_LIST,
    CK_FUNCTION_LIST_PTR_PTR, CK_NOTIFY, CK_OBJECT_HANDLE, CK_OBJECT_HANDLE_PTR, CK_RV,
    CK_SESSION_HANDLE, CK_SESSION_HANDLE_PTR, CK_SESSION_INFO, CK_SESSION_INFO_PTR, CK_SLOT_ID,
    CK_ULONG, CK_ULONG_PTR, CK_VERSION, CK_VOID_PTR, CKR_OK,
};
use tracing::{debug, info, trace};

use crate::{
    MResultHelper, ModuleError, ModuleResult,
    config::ModuleConfig,
    context::{AttributeRequest, Pkcs11Context},
    core::attribute::Attributes,
    logging::initialize_logging,
    traits::Token,
};

static CONTEXT: Lazy<RwLock<Option<Pkcs11Context>>> = Lazy::new(|| RwLock::new(None));

pub fn result_to_rv<F>(name: &str, f: F) -> CK_RV
where
    F: FnOnce() -> ModuleResult<()>,
{
    match f() {
        Ok(()) => CKR_OK,
        Err(e) => {
            tracing::error!("{}: {}", name, e);
            e.into()
        }
    }
}

#[macro_export]
macro_rules! cryptoki_fn {
    (fn $name:ident ( $($arg:ident : $type:ty),* $(,)?) $body:block) => {
        #[tracing::instrument(level = tracing::Level::TRACE, ret)]
        #[unsafe(no_mangle)]
        pub extern "C" fn $name($($arg: $type),*) -> CK_RV {
            result_to_rv(stringify!($name), || $body)
        }
    };
    (unsafe fn $name:ident ( $($arg:ident : $type:ty),* $(,)?) $body:block) => {
        #[tracing::instrument(level = tracing::Level::TRACE, ret)]
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $name($($arg: $type),*) -> pkcs11_sys::CK_RV {
            use $crate::pkcs11::result_to_rv;
            result_to_rv(stringify!($name), || $body)
        }
    };
}

macro_rules! cryptoki_fn_not_supported {
    ($name:ident, $($arg:ident: $type:ty),*) => {
        cryptoki_fn!(fn $name($($arg: $type),*) {Err(ModuleError::FunctionNotSupported)});
    };
}

#[macro_export]
macro_rules! not_null {
    ($ptr:expr, $variable_name:expr) => {
        if $ptr.is_null() {
            return Err(ModuleError::BadArguments(format!(
                "{} is a null pointer",
                $variable_name
            )));
        }
    };
}

/// Run `f` on the installed context, exclusively.
fn with_context<R, F>(f: F) -> ModuleResult<R>
where
    F: FnOnce(&mut Pkcs11Context) -> ModuleResult<R>,
{
    let mut guard = CONTEXT.write()?;
    let context = guard.as_mut().ok_or(ModuleError::CryptokiNotInitialized)?;
    f(context)
}

/// Run `f` on the installed context, alongside other readers.
fn with_context_ref<R, F>(f: F) -> ModuleResult<R>
where
    F: FnOnce(&Pkcs11Context) -> ModuleResult<R>,
{
    let guard = CONTEXT.read()?;
    let context = guard.as_ref().ok_or(ModuleError::CryptokiNotInitialized)?;
    f(context)
}

/// Declare a slot, with no token inserted.
pub fn add_slot(slot_id: CK_SLOT_ID) -> ModuleResult<()> {
    with_context(|context| {
        context.add_slot(slot_id);
        Ok(())
    })
}

/// Insert a token in a slot of the installed context.
pub fn register_token(slot_id: CK_SLOT_ID, token: Box<dyn Token>) -> ModuleResult<()> {
    with_context(|context| context.register_token(slot_id, token))
}

/// Remove the token of a slot of the installed context.
pub fn remove_token(slot_id: CK_SLOT_ID) -> ModuleResult<()> {
    with_context(|context| context.remove_token(slot_id))
}

pub static mut FUNC_LIST: CK_FUNCTION_LIST = CK_FUNCTION_LIST {
    // Cryptoki 2.40
    version: CK_VERSION { major: 2, minor: 40 },
    C_Initialize: Some(C_Initialize),
    C_Finalize: Some(C_Finalize),
    C_GetInfo: None,
    C_GetFunctionList: Some(C_GetFunctionList),
    C_GetSlotList: None,
    C_GetSlotInfo: None,
    C_GetTokenInfo: None,
    C_GetMechanismList: None,
    C_GetMechanismInfo: None,
    C_InitToken: None,
    C_InitPIN: None,
    C_SetPIN: None,
    C_OpenSession: Some(C_OpenSession),
    C_CloseSession: Some(C_CloseSession),
    C_CloseAllSessions: Some(C_CloseAllSessions),
    C_GetSessionInfo: Some(C_GetSessionInfo),
    C_GetOperationState: None,
    C_SetOperationState: None,
    C_Login: None,
    C_Logout: None,
    C_CreateObject: Some(C_CreateObject),
    C_CopyObject: Some(C_CopyObject),
    C_DestroyObject: Some(C_DestroyObject),
    C_GetObjectSize: Some(C_GetObjectSize),
    C_GetAttributeValue: Some(C_GetAttributeValue),
    C_SetAttributeValue: Some(C_SetAttributeValue),
    C_FindObjectsInit: Some(C_FindObjectsInit),
    C_FindObjects: Some(C_FindObjects),
    C_FindObjectsFinal: Some(C_FindObjectsFinal),
    C_EncryptInit: None,
    C_Encrypt: None,
    C_EncryptUpdate: None,
    C_EncryptFinal: None,
    C_DecryptInit: None,
    C_Decrypt: None,
    C_DecryptUpdate: None,
    C_DecryptFinal: None,
    C_DigestInit: None,
    C_Digest: None,
    C_DigestUpdate: None,
    C_DigestKey: None,
    C_DigestFinal: None,
    C_SignInit: None,
    C_Sign: None,
    C_SignUpdate: None,
    C_SignFinal: None,
    C_SignRecoverInit: None,
    C_SignRecover: None,
    C_VerifyInit: None,
    C_Verify: None,
    C_VerifyUpdate: None,
    C_VerifyFinal: None,
    C_VerifyRecoverInit: None,
    C_VerifyRecover: None,
    C_DigestEncryptUpdate: None,
    C_DecryptDigestUpdate: None,
    C_SignEncryptUpdate: None,
    C_DecryptVerifyUpdate: None,
    C_GenerateKey: None,
    C_GenerateKeyPair: None,
    C_WrapKey: None,
    C_UnwrapKey: None,
    C_DeriveKey: None,
    C_SeedRandom: None,
    C_GenerateRandom: None,
    C_GetFunctionStatus: None,
    C_CancelFunction: None,
    C_WaitForSlotEvent: None,
};

cryptoki_fn!(
    unsafe fn C_GetFunctionList(ppFunctionList: CK_FUNCTION_LIST_PTR_PTR) {
        not_null!(ppFunctionList, "C_GetFunctionList: ppFunctionList");
        unsafe {
            *ppFunctionList = addr_of_mut!(FUNC_LIST);
        }
        Ok(())
    }
);

cryptoki_fn!(
    unsafe fn C_Initialize(pInitArgs: CK_VOID_PTR) {
        if !pInitArgs.is_null() {
            let args = unsafe { &*(pInitArgs as CK_C_INITIALIZE_ARGS_PTR) };
            if !args.pReserved.is_null() {
                return Err(ModuleError::BadArguments(
                    "C_Initialize: pReserved must be null".to_owned(),
                ));
            }
        }
        let config = ModuleConfig::from_env();
        initialize_logging(&config);
        let mut guard = CONTEXT.write()?;
        if guard.is_some() {
            return Err(ModuleError::CryptokiAlreadyInitialized);
        }
        *guard = Some(Pkcs11Context::new());
        info!("C_Initialize: module initialized with {config:?}");
        Ok(())
    }
);

cryptoki_fn!(
    fn C_Finalize(pReserved: CK_VOID_PTR) {
        if !pReserved.is_null() {
            return Err(ModuleError::BadArguments(
                "C_Finalize: pReserved must be null".to_owned(),
            ));
        }
        let mut guard = CONTEXT.write()?;
        if guard.take().is_none() {
            return Err(ModuleError::CryptokiNotInitialized);
        }
        info!("C_Finalize: module finalized");
        Ok(())
    }
);

cryptoki_fn!(
    unsafe fn C_OpenSession(
        slotID: CK_SLOT_ID,
        flags: CK_FLAGS,
        pApplication: CK_VOID_PTR,
        Notify: CK_NOTIFY,
        phSession: CK_SESSION_HANDLE_PTR,
    ) {
        not_null!(phSession, "C_OpenSession: phSession");
        let session = with_context(|context| context.open_session(slotID, flags))?;
        unsafe {
            *phSession = session;
        }
        Ok(())
    }
);

cryptoki_fn!(
    fn C_CloseSession(hSession: CK_SESSION_HANDLE) {
        with_context(|context| context.close_session(hSession))
    }
);

cryptoki_fn!(
    fn C_CloseAllSessions(slotID: CK_SLOT_ID) {
        with_context(|context| context.close_all_sessions(slotID))
    }
);

cryptoki_fn!(
    unsafe fn C_GetSessionInfo(hSession: CK_SESSION_HANDLE, pInfo: CK_SESSION_INFO_PTR) {
        not_null!(pInfo, "C_GetSessionInfo: pInfo");
        let info = with_context_ref(|context| {
            let session = context.session(hSession)?;
            Ok(CK_SESSION_INFO {
                slotID: session.slot_id(),
                state: context.session_state(hSession)?,
                flags: session.flags(),
                ulDeviceError: 0,
            })
        })?;
        unsafe {
            *pInfo = info;
        }
        Ok(())
    }
);

cryptoki_fn!(
    unsafe fn C_CreateObject(
        hSession: CK_SESSION_HANDLE,
        pTemplate: CK_ATTRIBUTE_PTR,
        ulCount: CK_ULONG,
        phObject: CK_OBJECT_HANDLE_PTR,
    ) {
        not_null!(pTemplate, "C_CreateObject: pTemplate");
        not_null!(phObject, "C_CreateObject: phObject");
        let template = unsafe { Attributes::from_raw_template(pTemplate, ulCount) }
            .context("C_CreateObject: attributes conversion failed")?;
        debug!("C_CreateObject: session: {hSession}, template: {template:?}");
        let handle = with_context(|context| context.create_object(hSession, &template))?;
        unsafe {
            *phObject = handle;
        }
        Ok(())
    }
);

cryptoki_fn_not_supported!(
    C_CopyObject,
    hSession: CK_SESSION_HANDLE,
    hObject: CK_OBJECT_HANDLE,
    pTemplate: CK_ATTRIBUTE_PTR,
    ulCount: CK_ULONG,
    phNewObject: CK_OBJECT_HANDLE_PTR
);

cryptoki_fn!(
    fn C_DestroyObject(hSession: CK_SESSION_HANDLE, hObject: CK_OBJECT_HANDLE) {
        debug!("C_DestroyObject: session: {hSession}, object: {hObject}");
        with_context(|context| context.destroy_object(hSession, hObject))
    }
);

cryptoki_fn!(
    unsafe fn C_GetObjectSize(
        hSession: CK_SESSION_HANDLE,
        hObject: CK_OBJECT_HANDLE,
        pulSize: CK_ULONG_PTR,
    ) {
        not_null!(pulSize, "C_GetObjectSize: pulSize");
        let size = with_context_ref(|context| context.get_object_size(hSession, hObject))?;
        unsafe {
            *pulSize = CK_ULONG::try_from(size)?;
        }
        Ok(())
    }
);

cryptoki_fn!(
    unsafe fn C_GetAttributeValue(
        hSession: CK_SESSION_HANDLE,
        hObject: CK_OBJECT_HANDLE,
        pTemplate: CK_ATTRIBUTE_PTR,
        ulCount: CK_ULONG,
    ) {
        trace!("C_GetAttributeValue: session: {hSession}, object: {hObject}");
        let template: &mut [CK_ATTRIBUTE] = if ulCount > 0 {
            not_null!(pTemplate, "C_GetAttributeValue: pTemplate");
            unsafe { slice::from_raw_parts_mut(pTemplate, usize::try_from(ulCount)?) }
        } else {
            &mut []
        };
        let mut requests = template
            .iter()
            .map(|attribute| -> ModuleResult<AttributeRequest> {
                let capacity = if attribute.pValue.is_null() {
                    None
                } else {
                    Some(usize::try_from(attribute.ulValueLen)?)
                };
                Ok(AttributeRequest {
                    type_: attribute.type_,
                    capacity,
                    value: None,
                    value_len: attribute.ulValueLen,
                })
            })
            .collect::<ModuleResult<Vec<_>>>()?;

        let result = with_context_ref(|context| {
            context.get_attribute_value(hSession, hObject, &mut requests)
        });

        for (attribute, request) in template.iter_mut().zip(&requests) {
            attribute.ulValueLen = request.value_len;
            if let Some(value) = &request.value {
                unsafe { slice::from_raw_parts_mut(attribute.pValue.cast::<u8>(), value.len()) }
                    .copy_from_slice(value);
            }
        }
        result
    }
);

cryptoki_fn!(
    unsafe fn C_SetAttributeValue(
        hSession: CK_SESSION_HANDLE,
        hObject: CK_OBJECT_HANDLE,
        pTemplate: CK_ATTRIBUTE_PTR,
        ulCount: CK_ULONG,
    ) {
        not_null!(pTemplate, "C_SetAttributeValue: pTemplate");
        let template = unsafe { Attributes::from_raw_template(pTemplate, ulCount) }
            .context("C_SetAttributeValue: attributes conversion failed")?;
        debug!("C_SetAttributeValue: session: {hSession}, object: {hObject}, template: {template:?}");
        with_context(|context| context.set_attribute_value(hSession, hObject, &template))
    }
);

cryptoki_fn!(
    unsafe fn C_FindObjectsInit(
        hSession: CK_SESSION_HANDLE,
        pTemplate: CK_ATTRIBUTE_PTR,
        ulCount: CK_ULONG,
    ) {
        let template = unsafe { Attributes::from_raw_template(pTemplate, ulCount) }
            .context("C_FindObjectsInit: attributes conversion failed")?;
        info!("C_FindObjectsInit: session: {hSession}, template: {template:?}");
        with_context(|context| context.find_objects_init(hSession, &template))
    }
);

cryptoki_fn!(
    unsafe fn C_FindObjects(
        hSession: CK_SESSION_HANDLE,
        phObject: CK_OBJECT_HANDLE_PTR,
        ulMaxObjectCount: CK_ULONG,
        pulObjectCount: CK_ULONG_PTR,
    ) {
        not_null!(phObject, "C_FindObjects: phObject");
        not_null!(pulObjectCount, "C_FindObjects: pulObjectCount");
        let max_count = usize::try_from(ulMaxObjectCount)?;
        let handles = with_context(|context| context.find_objects(hSession, max_count))?;
        trace!("C_FindObjects: session: {hSession}, returning {handles:?}");
        unsafe { slice::from_raw_parts_mut(phObject, handles.len()) }
            .copy_from_slice(handles.as_slice());
        unsafe {
            *pulObjectCount = CK_ULONG::try_from(handles.len())?;
        }
        Ok(())
    }
);

cryptoki_fn!(
    fn C_FindObjectsFinal(hSession: CK_SESSION_HANDLE) {
        with_context(|context| context.find_objects_final(hSession))
    }
);
