//! # Plan Store Core
//!
//! A storage core for nested insurance plan documents, built on LMDB
//! (Lightning Memory-Mapped Database) and exposed through a C ABI so any host
//! (an HTTP server, a mobile runtime, a test harness) can drive it.
//!
//! ## How documents are stored
//!
//! A plan document is a tree of objects. Every object carries `objectType`
//! and `objectId`, which form its root key `"<objectType>:<objectId>"`. The
//! store never keeps the document as one blob:
//!
//! - **Flat records**: each object's scalar fields live in a hash keyed by
//!   the object's own root key.
//! - **Indirection sets**: each nested object or array of objects is a set
//!   keyed `"<parentKey>:<fieldName>"` listing the children's root keys.
//! - **Fingerprint**: the root record carries `eTag`, a quoted base64 SHA-256
//!   of the whole document, used for optimistic concurrency.
//!
//! Reads walk the namespace back into the full tree; deletes walk it and
//! remove every record the root owns. Each backend call touches a single
//! key; no multi-key transaction is used.
//!
//! ## Layers
//!
//! - [`kv_backend`] / [`local_db_state`]: the single-key primitives, in memory
//!   or on LMDB
//! - [`decompose`] / [`reconstruct`] / [`fingerprint`]: the document engine
//! - [`plan_store`]: root-key addressed store operations
//! - [`plan_service`]: conditional (ETag) operations with change events
//! - this module: C-ABI entry points returning JSON-encoded [`AppResponse`]s
//!
//! ## FFI Functions
//!
//! - [`create_db`] - Open or create a database
//! - [`post_plan`] - Store a new plan
//! - [`get_plan`] - Read a plan, honouring `If-Match` / `If-None-Match`
//! - [`get_all_plans`] - Read every plan
//! - [`put_plan`] - Replace a plan
//! - [`patch_plan`] - Merge changes into a plan
//! - [`delete_plan`] - Remove a plan and everything it owns
//! - [`get_etag`] - Current fingerprint of a plan
//! - [`take_change_events`] - Drain pending change events
//! - [`clear_all_records`] - Clear all database contents
//! - [`reset_database`] - Reset database to clean state
//! - [`close_database`] - Explicit connection cleanup
//! - [`free_response`] - Release a string returned by this library

pub mod app_response;
pub mod change_event;
pub mod decompose;
pub mod document_model;
pub mod fingerprint;
pub mod kv_backend;
pub mod local_db_state;
pub mod plan_service;
pub mod plan_store;
pub mod reconstruct;
pub mod store_error;

use std::ffi::{CStr, CString};
use std::os::raw::c_char;

use log::{info, warn};
use serde_json::{json, Value as JsonValue};

use crate::app_response::AppResponse;
use crate::document_model::PlanRecord;
use crate::local_db_state::AppDbState;
use crate::plan_service::ServiceResult;

/// Opens (or creates) the database `<name>.lmdb`.
///
/// # Parameters
///
/// * `name` - A null-terminated C string containing the database name
///
/// # Returns
///
/// A pointer to the [`AppDbState`] instance on success, or a null pointer if
/// the name is null, not UTF-8, or the environment cannot be opened. The
/// caller owns the pointer.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn create_db(name: *const c_char) -> *mut AppDbState {
    if name.is_null() {
        warn!("Null name pointer passed to create_db");
        return std::ptr::null_mut();
    }

    let name_str = match unsafe { CStr::from_ptr(name).to_str() } {
        Ok(s) => s,
        Err(e) => {
            warn!("Invalid UTF-8 in name parameter: {e}");
            return std::ptr::null_mut();
        }
    };

    match AppDbState::init(name_str.to_string()) {
        Ok(state) => {
            info!("Database '{}' initialized", name_str);
            Box::into_raw(Box::new(state))
        }
        Err(e) => {
            warn!("Failed to initialize database '{}': {}", name_str, e);
            std::ptr::null_mut()
        }
    }
}

/// Stores a new plan document.
///
/// The document is validated structurally (identity fields on every object,
/// no `:` in identifiers or field names), then decomposed into the store and
/// a `SAVE` change event is queued.
///
/// # Returns
///
/// `Created` with `{"key": ..., "etag": ...}`; `Conflict` if a plan with the
/// same root key exists; `ValidationError` / `SerializationError` for bad
/// input.
///
/// # Safety
///
/// Both parameters must be valid pointers (null is reported as `BadRequest`).
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn post_plan(state: *mut AppDbState, json_ptr: *const c_char) -> *const c_char {
    let state = match state_ref(state, "post_plan") {
        Ok(state) => state,
        Err(err) => return err,
    };
    let document = match c_ptr_to_json(json_ptr) {
        Ok(document) => document,
        Err(err) => return err,
    };

    match state.service().create(&document) {
        Ok(record) => {
            let body = json!({ "key": record.key, "etag": record.etag });
            response_to_c_string(&AppResponse::Created(body.to_string()))
        }
        Err(e) => response_to_c_string(&e),
    }
}

/// Reads a plan by root key (e.g. `"plan:12xvxc345ssdsds-508"`).
///
/// `if_match` and `if_none_match` may be null. A non-matching `if_match`
/// yields `PreconditionFailed`; an `if_none_match` equal to the current ETag
/// yields `NotModified`.
///
/// # Returns
///
/// `Ok` with a serialized [`PlanRecord`] (`key`, `etag`, `document`).
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn get_plan(
    state: *mut AppDbState,
    key: *const c_char,
    if_match: *const c_char,
    if_none_match: *const c_char,
) -> *const c_char {
    let state = match state_ref(state, "get_plan") {
        Ok(state) => state,
        Err(err) => return err,
    };
    let key = match c_ptr_to_string(key, "key") {
        Ok(key) => key,
        Err(err) => return err,
    };
    let (if_match, if_none_match) = match conditional_headers(if_match, if_none_match) {
        Ok(headers) => headers,
        Err(err) => return err,
    };

    let result = state
        .service()
        .get(&key, if_match.as_deref(), if_none_match.as_deref());
    record_response(result)
}

/// Reads every stored plan.
///
/// # Returns
///
/// `Ok` with a JSON array of [`PlanRecord`]s, or `NotFound` when no plan is
/// stored.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn get_all_plans(state: *mut AppDbState) -> *const c_char {
    let state = match state_ref(state, "get_all_plans") {
        Ok(state) => state,
        Err(err) => return err,
    };

    match state.service().list() {
        Ok(records) if records.is_empty() => {
            response_to_c_string(&AppResponse::NotFound("No plans found".to_string()))
        }
        Ok(records) => match serde_json::to_string(&records) {
            Ok(json) => response_to_c_string(&AppResponse::Ok(json)),
            Err(e) => response_to_c_string(&AppResponse::from(e)),
        },
        Err(e) => response_to_c_string(&e),
    }
}

/// Replaces the plan under `key` with a new document.
///
/// The previous tree is removed first. `if_match` may be null; when given it
/// must equal the current ETag.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn put_plan(
    state: *mut AppDbState,
    key: *const c_char,
    json_ptr: *const c_char,
    if_match: *const c_char,
) -> *const c_char {
    let state = match state_ref(state, "put_plan") {
        Ok(state) => state,
        Err(err) => return err,
    };
    let key = match c_ptr_to_string(key, "key") {
        Ok(key) => key,
        Err(err) => return err,
    };
    let document = match c_ptr_to_json(json_ptr) {
        Ok(document) => document,
        Err(err) => return err,
    };
    let if_match = match optional_c_ptr_to_string(if_match, "If-Match") {
        Ok(tag) => tag,
        Err(err) => return err,
    };

    let result = state
        .service()
        .replace(&key, &document, if_match.as_deref());
    record_response(result)
}

/// Merges a partial document into the plan under `key`.
///
/// One of `if_match` / `if_none_match` must be non-null and non-empty,
/// otherwise `BadRequest` is returned. Arrays of objects are appended to,
/// matching elements by `objectType`/`objectId`.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn patch_plan(
    state: *mut AppDbState,
    key: *const c_char,
    json_ptr: *const c_char,
    if_match: *const c_char,
    if_none_match: *const c_char,
) -> *const c_char {
    let state = match state_ref(state, "patch_plan") {
        Ok(state) => state,
        Err(err) => return err,
    };
    let key = match c_ptr_to_string(key, "key") {
        Ok(key) => key,
        Err(err) => return err,
    };
    let patch = match c_ptr_to_json(json_ptr) {
        Ok(patch) => patch,
        Err(err) => return err,
    };
    let (if_match, if_none_match) = match conditional_headers(if_match, if_none_match) {
        Ok(headers) => headers,
        Err(err) => return err,
    };

    let result = state.service().patch(
        &key,
        &patch,
        if_match.as_deref(),
        if_none_match.as_deref(),
    );
    record_response(result)
}

/// Deletes the plan under `key` and every record it owns.
///
/// Same precondition rules as [`patch_plan`].
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn delete_plan(
    state: *mut AppDbState,
    key: *const c_char,
    if_match: *const c_char,
    if_none_match: *const c_char,
) -> *const c_char {
    let state = match state_ref(state, "delete_plan") {
        Ok(state) => state,
        Err(err) => return err,
    };
    let key = match c_ptr_to_string(key, "key") {
        Ok(key) => key,
        Err(err) => return err,
    };
    let (if_match, if_none_match) = match conditional_headers(if_match, if_none_match) {
        Ok(headers) => headers,
        Err(err) => return err,
    };

    match state
        .service()
        .delete(&key, if_match.as_deref(), if_none_match.as_deref())
    {
        Ok(record) => {
            response_to_c_string(&AppResponse::success(format!("Plan '{}' deleted", record.key)))
        }
        Err(e) => response_to_c_string(&e),
    }
}

/// Current ETag of the plan under `key`, or `NotFound`.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn get_etag(state: *mut AppDbState, key: *const c_char) -> *const c_char {
    let state = match state_ref(state, "get_etag") {
        Ok(state) => state,
        Err(err) => return err,
    };
    let key = match c_ptr_to_string(key, "key") {
        Ok(key) => key,
        Err(err) => return err,
    };

    match state.service().store().current_fingerprint(&key) {
        Ok(Some(etag)) => response_to_c_string(&AppResponse::Ok(etag)),
        Ok(None) => response_to_c_string(&AppResponse::NotFound(format!(
            "No plan found with key: {key}"
        ))),
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

/// Drains the change events queued since the last call.
///
/// # Returns
///
/// `Ok` with a JSON array of `{"operation": "SAVE"|"UPDATE"|"DELETE", "body": "<document>"}`,
/// oldest first. The host forwards these to its message bus.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn take_change_events(state: *mut AppDbState) -> *const c_char {
    let state = match state_ref(state, "take_change_events") {
        Ok(state) => state,
        Err(err) => return err,
    };

    let events = state.service().events().drain();
    match serde_json::to_string(&events) {
        Ok(json) => response_to_c_string(&AppResponse::Ok(json)),
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

/// Clears all records from the database.
///
/// The database remains operational after this call. Pending change events
/// are left untouched.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn clear_all_records(db_state: *mut AppDbState) -> *const c_char {
    let db_state = match state_ref(db_state, "clear_all_records") {
        Ok(state) => state,
        Err(err) => return err,
    };

    match db_state.clear_all_records() {
        Ok(count) => response_to_c_string(&AppResponse::success(format!(
            "{count} records cleared"
        ))),
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

/// Resets the database to a clean state under a (possibly new) name.
///
/// This operation:
/// 1. Clears the current database
/// 2. When the name changes, opens `<name>.lmdb` and removes the old directory
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn reset_database(db_state: *mut AppDbState, name_ptr: *const c_char) -> *const c_char {
    if db_state.is_null() {
        let error = AppResponse::BadRequest("Null state pointer passed to reset_database".to_string());
        return response_to_c_string(&error);
    }

    let name = match c_ptr_to_string(name_ptr, "name") {
        Ok(name) => name,
        Err(error_ptr) => return error_ptr,
    };

    let db_state = unsafe { &mut *db_state };

    match db_state.reset_database(&name) {
        Ok(_) => {
            let success = AppResponse::Ok(format!("Database '{name}' was reset successfully"));
            response_to_c_string(&success)
        }
        Err(e) => {
            let error = AppResponse::DatabaseError(format!("Error resetting database: {e}"));
            response_to_c_string(&error)
        }
    }
}

/// Flushes the database to disk before the host releases it.
///
/// # Notes
///
/// In LMDB, the environment is closed when it is dropped; the handle stays
/// usable after this call.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn close_database(db_state: *mut AppDbState) -> *const c_char {
    if db_state.is_null() {
        let error = AppResponse::BadRequest("Null state pointer passed to close_database".to_string());
        return response_to_c_string(&error);
    }

    let db_state = unsafe { &mut *db_state };

    match db_state.close_database() {
        Ok(_) => {
            let success = AppResponse::Ok("Database connection closed successfully".to_string());
            response_to_c_string(&success)
        }
        Err(e) => response_to_c_string(&AppResponse::from(e)),
    }
}

/// Releases a string previously returned by this library. Null is ignored.
#[no_mangle]
#[allow(clippy::not_unsafe_ptr_arg_deref)]
pub extern "C" fn free_response(ptr: *const c_char) {
    if ptr.is_null() {
        return;
    }
    unsafe {
        drop(CString::from_raw(ptr as *mut c_char));
    }
}

/// Converts an [`AppResponse`] to a C-compatible string.
///
/// Returns a null pointer if serialization or C string creation fails.
fn response_to_c_string(response: &AppResponse) -> *const c_char {
    let json = match serde_json::to_string(response) {
        Ok(j) => j,
        Err(e) => {
            warn!("Error serializing response: {e}");
            return std::ptr::null();
        }
    };

    match CString::new(json) {
        Ok(c_str) => c_str.into_raw(),
        Err(e) => {
            warn!("Error creating CString: {e}");
            std::ptr::null()
        }
    }
}

fn record_response(result: ServiceResult<PlanRecord>) -> *const c_char {
    match result {
        Ok(record) => match serde_json::to_string(&record) {
            Ok(json) => response_to_c_string(&AppResponse::Ok(json)),
            Err(e) => response_to_c_string(&AppResponse::from(e)),
        },
        Err(e) => response_to_c_string(&e),
    }
}

fn state_ref<'a>(state: *mut AppDbState, caller: &str) -> Result<&'a AppDbState, *const c_char> {
    match unsafe { state.as_ref() } {
        Some(state) => Ok(state),
        None => {
            let error = AppResponse::BadRequest(format!("Null state pointer passed to {caller}"));
            Err(response_to_c_string(&error))
        }
    }
}

/// Converts a C string pointer to a Rust String.
///
/// # Returns
///
/// * `Ok(String)` - If conversion was successful
/// * `Err(*const c_char)` - `BadRequest` response for null pointers or invalid UTF-8
fn c_ptr_to_string(ptr: *const c_char, field_name: &str) -> Result<String, *const c_char> {
    if ptr.is_null() {
        let error = AppResponse::BadRequest(format!("Null {field_name} pointer"));
        return Err(response_to_c_string(&error));
    }

    match unsafe { CStr::from_ptr(ptr).to_str() } {
        Ok(s) => Ok(s.to_string()),
        Err(e) => {
            let error = AppResponse::BadRequest(format!("Invalid UTF-8 in {field_name}: {e}"));
            Err(response_to_c_string(&error))
        }
    }
}

/// Like [`c_ptr_to_string`], but a null pointer means "not supplied".
fn optional_c_ptr_to_string(
    ptr: *const c_char,
    field_name: &str,
) -> Result<Option<String>, *const c_char> {
    if ptr.is_null() {
        return Ok(None);
    }
    c_ptr_to_string(ptr, field_name).map(Some)
}

fn conditional_headers(
    if_match: *const c_char,
    if_none_match: *const c_char,
) -> Result<(Option<String>, Option<String>), *const c_char> {
    let if_match = optional_c_ptr_to_string(if_match, "If-Match")?;
    let if_none_match = optional_c_ptr_to_string(if_none_match, "If-None-Match")?;
    Ok((if_match, if_none_match))
}

fn c_ptr_to_json(ptr: *const c_char) -> Result<JsonValue, *const c_char> {
    let json_str = c_ptr_to_string(ptr, "JSON")?;
    serde_json::from_str(&json_str).map_err(|e| {
        let error = AppResponse::SerializationError(format!("Invalid JSON: {e}"));
        response_to_c_string(&error)
    })
}
