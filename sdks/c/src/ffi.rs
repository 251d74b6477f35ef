//! C FFI bindings for the USM service manager
//!
//! This module exposes a small synchronous C API over the async service
//! manager. Every handle owns a tokio runtime and blocks on it for each call.
//!
//! # Safety
//!
//! All functions in this module are unsafe because they:
//! - Dereference raw pointers passed from C
//! - Require the caller to release returned buffers with the matching free
//!   function exactly once

#![allow(unsafe_op_in_unsafe_fn)]
#![allow(clippy::missing_safety_doc)]

use std::ffi::{CStr, CString};
use std::mem::ManuallyDrop;
use std::os::raw::c_char;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::ptr;
use std::sync::Arc;

use usm::{ConfigSource, ServiceInstance, ServiceManager, ServiceStatus, StartOptions};
use usm_shared::constants::server::DEFAULT_PORT;
use usm_shared::errors::{ProbeError, SpawnError, UsmError, UsmResult};

use crate::registry::{self, HandleEntry};

// ============================================================================
// Status and Error Codes
// ============================================================================

pub const USM_STATUS_STOPPED: i32 = 0;
pub const USM_STATUS_RUNNING: i32 = 1;
pub const USM_STATUS_ERROR: i32 = 2;
pub const USM_STATUS_STARTING: i32 = 3;
pub const USM_STATUS_STOPPING: i32 = 4;
pub const USM_STATUS_UNKNOWN: i32 = 5;

/// Result codes returned by USM control functions.
///
/// Zero is success; each failure cause has its own stable negative value.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsmErrorCode {
    /// Operation succeeded
    Ok = 0,
    /// Internal or unclassified error
    Internal = -1,
    /// Handle is NULL, never issued, or already destroyed
    InvalidHandle = -2,
    /// Invalid argument provided
    InvalidArgument = -3,
    /// Instance or template not found
    NotFound = -4,
    /// Instance is already running
    AlreadyRunning = -5,
    /// Instance is not running
    NotRunning = -6,
    /// Instance is starting or stopping
    TransitionInProgress = -7,
    /// Port is held by another instance or bound on the host
    PortInUse = -8,
    /// Service executable could not be found
    ExecutableNotFound = -9,
    /// Service executable could not be run
    PermissionDenied = -10,
    /// Other process spawn failure
    SpawnFailed = -11,
    /// Stop signal could not be delivered
    Signal = -12,
    /// Process could not be observed
    Probe = -13,
    /// Configuration error
    Config = -14,
    /// Template allows one instance and another one is live
    SingleInstance = -15,
}

/// Opaque handle to a service manager.
///
/// The pointer value is a registry token and is never dereferenced.
pub struct UsmHandle {
    _private: [u8; 0],
}

/// Snapshot of one service instance.
///
/// Strings are owned by the enclosing array and released by
/// `usm_free_services`.
#[repr(C)]
pub struct CServiceInfo {
    pub id: *mut c_char,
    pub template_id: *mut c_char,
    pub display_name: *mut c_char,
    pub port: u16,
    /// One of the `USM_STATUS_*` values
    pub status: i32,
    pub cpu_percent: f64,
    pub memory_mb: u64,
}

#[repr(C)]
pub struct CServiceArray {
    pub data: *mut CServiceInfo,
    pub len: usize,
    pub capacity: usize,
}

// ============================================================================
// Conversion Helpers
// ============================================================================

/// Map UsmError to UsmErrorCode
fn error_to_code(err: &UsmError) -> UsmErrorCode {
    match err {
        UsmError::Config(_) => UsmErrorCode::Config,
        UsmError::NotFound(_) => UsmErrorCode::NotFound,
        UsmError::AlreadyRunning(_) => UsmErrorCode::AlreadyRunning,
        UsmError::NotRunning(_) => UsmErrorCode::NotRunning,
        UsmError::TransitionInProgress { .. } => UsmErrorCode::TransitionInProgress,
        UsmError::PortInUse { .. } => UsmErrorCode::PortInUse,
        UsmError::SingleInstance { .. } => UsmErrorCode::SingleInstance,
        UsmError::Spawn(spawn) => match spawn {
            SpawnError::ExecutableNotFound(_) => UsmErrorCode::ExecutableNotFound,
            SpawnError::PermissionDenied(_) => UsmErrorCode::PermissionDenied,
            SpawnError::PortInUse(_) => UsmErrorCode::PortInUse,
            SpawnError::Io(_) => UsmErrorCode::SpawnFailed,
        },
        UsmError::Signal(_) => UsmErrorCode::Signal,
        UsmError::Probe(_) => UsmErrorCode::Probe,
        UsmError::InvalidHandle => UsmErrorCode::InvalidHandle,
        UsmError::InvalidArgument(_) => UsmErrorCode::InvalidArgument,
        UsmError::Internal(_) => UsmErrorCode::Internal,
    }
}

fn status_to_code(status: ServiceStatus) -> i32 {
    match status {
        ServiceStatus::Stopped => USM_STATUS_STOPPED,
        ServiceStatus::Running => USM_STATUS_RUNNING,
        ServiceStatus::Error => USM_STATUS_ERROR,
        ServiceStatus::Starting => USM_STATUS_STARTING,
        ServiceStatus::Stopping => USM_STATUS_STOPPING,
        ServiceStatus::Unknown => USM_STATUS_UNKNOWN,
    }
}

/// Helper to convert C string to Rust string
unsafe fn c_str_to_string(s: *const c_char) -> Result<String, UsmError> {
    if s.is_null() {
        return Err(UsmError::InvalidArgument("null string".to_string()));
    }
    unsafe {
        CStr::from_ptr(s)
            .to_str()
            .map(|s| s.to_string())
            .map_err(|e| UsmError::InvalidArgument(format!("invalid UTF-8: {}", e)))
    }
}

/// Copy a Rust string into a C string owned by the caller.
///
/// Interior NUL bytes are dropped rather than failing the whole call.
fn to_c_string(s: &str) -> *mut c_char {
    CString::new(s.replace('\0', "")).unwrap_or_default().into_raw()
}

/// Like [`to_c_string`], for strings released through `usm_free_string`.
fn issue_c_string(s: &str) -> *mut c_char {
    let raw = to_c_string(s);
    registry::track_string(raw as usize);
    raw
}

unsafe fn free_c_string(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}

fn to_service_info(instance: &ServiceInstance) -> CServiceInfo {
    CServiceInfo {
        id: to_c_string(&instance.instance_id),
        template_id: to_c_string(&instance.template_id),
        display_name: to_c_string(&instance.display_name),
        port: instance.port,
        status: status_to_code(instance.status),
        cpu_percent: instance.cpu_percent,
        memory_mb: instance.memory_mb,
    }
}

fn resolve(handle: *const UsmHandle) -> UsmResult<HandleEntry> {
    if handle.is_null() {
        return Err(UsmError::InvalidHandle);
    }
    registry::lookup(handle as usize).ok_or(UsmError::InvalidHandle)
}

/// Run `f`, turning a panic into `fallback` so it never unwinds into C.
fn guard<T>(name: &'static str, fallback: T, f: impl FnOnce() -> T) -> T {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(_) => {
            tracing::error!(function = name, "Panic caught at the C boundary");
            fallback
        }
    }
}

fn result_to_code(name: &'static str, result: UsmResult<()>) -> i32 {
    match result {
        Ok(()) => UsmErrorCode::Ok as i32,
        Err(err) => {
            tracing::debug!(function = name, error = %err, "Call failed");
            error_to_code(&err) as i32
        }
    }
}

/// Shared shape of the per-instance control calls.
fn instance_command(
    name: &'static str,
    handle: *mut UsmHandle,
    instance_id: *const c_char,
    command: impl FnOnce(&HandleEntry, &str) -> UsmResult<ServiceInstance>,
) -> i32 {
    guard(name, UsmErrorCode::Internal as i32, || {
        let result = resolve(handle).and_then(|entry| {
            let id = unsafe { c_str_to_string(instance_id)? };
            command(&entry, &id).map(|_| ())
        });
        result_to_code(name, result)
    })
}

/// Get USM version string
///
/// # Returns
/// Static string containing the version (e.g., "0.3.0")
#[unsafe(no_mangle)]
pub extern "C" fn usm_version() -> *const c_char {
    // Static string, safe to return pointer
    concat!(env!("CARGO_PKG_VERSION"), "\0").as_ptr() as *const c_char
}

/// Port of the companion management server.
#[unsafe(no_mangle)]
pub extern "C" fn usm_get_server_port() -> u16 {
    DEFAULT_PORT
}

// ============================================================================
// Manager Lifecycle
// ============================================================================

/// Create a service manager.
///
/// # Arguments
/// * `config_path` - Path to a YAML configuration file, or NULL for
///   `~/.usm/services.yaml` (written with defaults when missing)
///
/// # Returns
/// Handle on success, NULL if the configuration cannot be loaded
#[unsafe(no_mangle)]
pub unsafe extern "C" fn usm_create(config_path: *const c_char) -> *mut UsmHandle {
    guard("usm_create", ptr::null_mut(), || {
        let source = if config_path.is_null() {
            ConfigSource::Default
        } else {
            match unsafe { c_str_to_string(config_path) } {
                Ok(path) => ConfigSource::Path(PathBuf::from(path)),
                Err(e) => {
                    tracing::error!(error = %e, "Invalid config path");
                    return ptr::null_mut();
                }
            }
        };

        let tokio_rt = match tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => Arc::new(rt),
            Err(e) => {
                tracing::error!(error = %e, "Failed to create async runtime");
                return ptr::null_mut();
            }
        };

        let manager = match ServiceManager::from_source(&source) {
            Ok(manager) => Arc::new(manager),
            Err(e) => {
                tracing::error!(error = %e, "Failed to create service manager");
                return ptr::null_mut();
            }
        };

        {
            let _enter = tokio_rt.enter();
            manager.start_sampler();
        }

        let entry = HandleEntry { manager, tokio_rt };
        match registry::register(entry.clone()) {
            Some(token) => token as *mut UsmHandle,
            None => {
                tracing::error!("Handle registry is full");
                entry.tokio_rt.block_on(entry.manager.shutdown());
                ptr::null_mut()
            }
        }
    })
}

/// Stop every running instance and invalidate the handle.
///
/// NULL, unknown and already destroyed handles are ignored.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn usm_destroy(handle: *mut UsmHandle) {
    guard("usm_destroy", (), || {
        if handle.is_null() {
            return;
        }
        let Some(entry) = registry::unregister(handle as usize) else {
            tracing::warn!("usm_destroy called with an invalid handle");
            return;
        };
        let failures = entry.tokio_rt.block_on(entry.manager.shutdown());
        for (id, err) in failures {
            tracing::warn!(instance_id = %id, error = %err, "Instance did not stop cleanly");
        }
    })
}

// ============================================================================
// Queries
// ============================================================================

/// Snapshot every known instance.
///
/// # Returns
/// Array owned by the caller (release with `usm_free_services`), or NULL
/// for an invalid handle
#[unsafe(no_mangle)]
pub unsafe extern "C" fn usm_get_services(handle: *const UsmHandle) -> *mut CServiceArray {
    guard("usm_get_services", ptr::null_mut(), || {
        let entry = match resolve(handle) {
            Ok(entry) => entry,
            Err(_) => return ptr::null_mut(),
        };
        let infos: Vec<CServiceInfo> = entry.manager.list().iter().map(to_service_info).collect();
        let mut infos = ManuallyDrop::new(infos);
        let array = Box::into_raw(Box::new(CServiceArray {
            data: infos.as_mut_ptr(),
            len: infos.len(),
            capacity: infos.capacity(),
        }));
        registry::track_array(array as usize);
        array
    })
}

/// Release an array returned by `usm_get_services`.
///
/// NULL and already released arrays are ignored.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn usm_free_services(array: *mut CServiceArray) {
    guard("usm_free_services", (), || {
        if array.is_null() {
            return;
        }
        if !registry::release_array(array as usize) {
            tracing::warn!("usm_free_services called on an array that is not live");
            return;
        }
        unsafe {
            let array = Box::from_raw(array);
            let infos = Vec::from_raw_parts(array.data, array.len, array.capacity);
            for info in infos {
                free_c_string(info.id);
                free_c_string(info.template_id);
                free_c_string(info.display_name);
            }
        }
    })
}

/// Description of the instance's last failure.
///
/// # Returns
/// String owned by the caller (release with `usm_free_string`), or NULL when
/// the instance has no recorded failure or cannot be found
#[unsafe(no_mangle)]
pub unsafe extern "C" fn usm_service_error(
    handle: *const UsmHandle,
    instance_id: *const c_char,
) -> *mut c_char {
    guard("usm_service_error", ptr::null_mut(), || {
        let instance = resolve(handle).and_then(|entry| {
            let id = unsafe { c_str_to_string(instance_id)? };
            entry.manager.get(&id)
        });
        match instance {
            Ok(ServiceInstance {
                last_error: Some(cause),
                ..
            }) => issue_c_string(&cause.to_string()),
            _ => ptr::null_mut(),
        }
    })
}

/// Health check URL of the instance, rendered for its current port.
///
/// # Returns
/// String owned by the caller (release with `usm_free_string`), or NULL when
/// the template has no health endpoint or the instance cannot be found
#[unsafe(no_mangle)]
pub unsafe extern "C" fn usm_service_health_endpoint(
    handle: *const UsmHandle,
    instance_id: *const c_char,
) -> *mut c_char {
    guard("usm_service_health_endpoint", ptr::null_mut(), || {
        let instance = resolve(handle).and_then(|entry| {
            let id = unsafe { c_str_to_string(instance_id)? };
            entry.manager.get(&id)
        });
        match instance.ok().and_then(|i| i.health_endpoint) {
            Some(url) => issue_c_string(&url),
            None => ptr::null_mut(),
        }
    })
}

/// Manager counters as a JSON object.
///
/// # Returns
/// String owned by the caller (release with `usm_free_string`), or NULL for
/// an invalid handle
#[unsafe(no_mangle)]
pub unsafe extern "C" fn usm_metrics_json(handle: *const UsmHandle) -> *mut c_char {
    guard("usm_metrics_json", ptr::null_mut(), || {
        let Ok(entry) = resolve(handle) else {
            return ptr::null_mut();
        };
        match serde_json::to_string(&entry.manager.metrics()) {
            Ok(json) => issue_c_string(&json),
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize metrics");
                ptr::null_mut()
            }
        }
    })
}

// ============================================================================
// Service Control
// ============================================================================

/// Start an instance, creating it from the matching template if unknown.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn usm_start_service(
    handle: *mut UsmHandle,
    instance_id: *const c_char,
) -> i32 {
    instance_command("usm_start_service", handle, instance_id, |entry, id| {
        entry.tokio_rt.block_on(entry.manager.start(id))
    })
}

/// Start an instance on an explicit port.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn usm_start_service_on_port(
    handle: *mut UsmHandle,
    instance_id: *const c_char,
    port: u16,
) -> i32 {
    instance_command(
        "usm_start_service_on_port",
        handle,
        instance_id,
        |entry, id| {
            entry
                .tokio_rt
                .block_on(entry.manager.start_with(id, StartOptions::on_port(port)))
        },
    )
}

/// Gracefully stop an instance, escalating to a kill after the grace timeout.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn usm_stop_service(
    handle: *mut UsmHandle,
    instance_id: *const c_char,
) -> i32 {
    instance_command("usm_stop_service", handle, instance_id, |entry, id| {
        entry.tokio_rt.block_on(entry.manager.stop(id))
    })
}

/// Stop then start an instance on the same port.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn usm_restart_service(
    handle: *mut UsmHandle,
    instance_id: *const c_char,
) -> i32 {
    instance_command("usm_restart_service", handle, instance_id, |entry, id| {
        entry.tokio_rt.block_on(entry.manager.restart(id))
    })
}

/// Forget an instance that holds no process.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn usm_deregister_service(
    handle: *mut UsmHandle,
    instance_id: *const c_char,
) -> i32 {
    instance_command("usm_deregister_service", handle, instance_id, |entry, id| {
        entry.manager.deregister(id)
    })
}

/// Probe and sample every running instance now.
///
/// # Returns
/// 0 when every probe succeeded, the Probe code if any instance failed
#[unsafe(no_mangle)]
pub unsafe extern "C" fn usm_refresh_services(handle: *mut UsmHandle) -> i32 {
    guard("usm_refresh_services", UsmErrorCode::Internal as i32, || {
        let result = resolve(handle).and_then(|entry| {
            let report = entry.tokio_rt.block_on(entry.manager.refresh_all());
            match report.failed.first() {
                None => Ok(()),
                Some((id, reason)) => Err(ProbeError(format!("{}: {}", id, reason)).into()),
            }
        });
        result_to_code("usm_refresh_services", result)
    })
}

// ============================================================================
// Memory Management
// ============================================================================

/// Free a string returned by `usm_service_error` or `usm_metrics_json`.
///
/// NULL, foreign and already released strings are ignored.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn usm_free_string(str: *mut c_char) {
    guard("usm_free_string", (), || {
        if str.is_null() {
            return;
        }
        if !registry::release_string(str as usize) {
            tracing::warn!("usm_free_string called on a string that is not live");
            return;
        }
        unsafe { free_c_string(str) };
    })
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use usm_shared::errors::SignalError;

    fn code(err: UsmError) -> i32 {
        error_to_code(&err) as i32
    }

    fn write_config(yaml: &str) -> (tempfile::TempDir, CString) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.yaml");
        std::fs::write(&path, yaml).unwrap();
        let c_path = CString::new(path.to_str().unwrap()).unwrap();
        (dir, c_path)
    }

    #[test]
    fn test_version() {
        unsafe {
            let version = CStr::from_ptr(usm_version()).to_str().unwrap();
            assert!(!version.is_empty());
            assert!(version.contains('.'));
        }
    }

    #[test]
    fn test_server_port() {
        assert_eq!(usm_get_server_port(), 8767);
    }

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(code(UsmError::Internal("x".into())), -1);
        assert_eq!(code(UsmError::InvalidHandle), -2);
        assert_eq!(code(UsmError::InvalidArgument("x".into())), -3);
        assert_eq!(code(UsmError::NotFound("x".into())), -4);
        assert_eq!(code(UsmError::AlreadyRunning("x".into())), -5);
        assert_eq!(code(UsmError::NotRunning("x".into())), -6);
        assert_eq!(
            code(UsmError::TransitionInProgress {
                id: "x".into(),
                status: "starting".into()
            }),
            -7
        );
        assert_eq!(
            code(UsmError::PortInUse {
                port: 9000,
                holder: "a".into()
            }),
            -8
        );
        assert_eq!(code(SpawnError::PortInUse(9000).into()), -8);
        assert_eq!(code(SpawnError::ExecutableNotFound("x".into()).into()), -9);
        assert_eq!(code(SpawnError::PermissionDenied("x".into()).into()), -10);
        assert_eq!(code(SpawnError::Io("x".into()).into()), -11);
        assert_eq!(code(SignalError("x".into()).into()), -12);
        assert_eq!(code(ProbeError("x".into()).into()), -13);
        assert_eq!(code(UsmError::Config("x".into())), -14);
        assert_eq!(
            code(UsmError::SingleInstance {
                template: "db".into(),
                holder: "db-1".into()
            }),
            -15
        );
    }

    #[test]
    fn test_status_to_code() {
        assert_eq!(status_to_code(ServiceStatus::Stopped), USM_STATUS_STOPPED);
        assert_eq!(status_to_code(ServiceStatus::Running), USM_STATUS_RUNNING);
        assert_eq!(status_to_code(ServiceStatus::Error), USM_STATUS_ERROR);
        assert_eq!(status_to_code(ServiceStatus::Starting), USM_STATUS_STARTING);
        assert_eq!(status_to_code(ServiceStatus::Stopping), USM_STATUS_STOPPING);
        assert_eq!(status_to_code(ServiceStatus::Unknown), USM_STATUS_UNKNOWN);
    }

    #[test]
    fn test_c_string_conversion() {
        let test_str = CString::new("hello").unwrap();
        unsafe {
            assert_eq!(c_str_to_string(test_str.as_ptr()).unwrap(), "hello");
            assert!(c_str_to_string(ptr::null()).is_err());
        }
    }

    #[test]
    fn test_interior_nul_is_dropped() {
        let s = issue_c_string("a\0b");
        unsafe {
            assert_eq!(CStr::from_ptr(s).to_str().unwrap(), "ab");
            usm_free_string(s);
        }
    }

    #[test]
    fn test_null_pointer_validation() {
        let id = CString::new("web-1").unwrap();
        unsafe {
            assert_eq!(usm_start_service(ptr::null_mut(), id.as_ptr()), -2);
            assert_eq!(usm_stop_service(ptr::null_mut(), id.as_ptr()), -2);
            assert_eq!(usm_restart_service(ptr::null_mut(), id.as_ptr()), -2);
            assert_eq!(usm_refresh_services(ptr::null_mut()), -2);
            assert!(usm_get_services(ptr::null()).is_null());
            assert!(usm_metrics_json(ptr::null()).is_null());
            // Forged handles never resolve.
            assert_eq!(usm_start_service(0xdead as *mut UsmHandle, id.as_ptr()), -2);
        }
    }

    #[test]
    fn test_string_double_free_is_ignored() {
        let (_dir, path) = write_config("templates: []\n");
        unsafe {
            let handle = usm_create(path.as_ptr());
            let metrics = usm_metrics_json(handle);
            assert!(!metrics.is_null());
            usm_free_string(metrics);
            usm_free_string(metrics);

            // Strings owned by an array are not released through this path.
            let unowned = to_c_string("array-owned");
            usm_free_string(unowned);
            assert_eq!(CStr::from_ptr(unowned).to_str().unwrap(), "array-owned");
            free_c_string(unowned);

            usm_destroy(handle);
        }
    }

    #[test]
    fn test_free_null_safe() {
        unsafe {
            usm_free_services(ptr::null_mut());
            usm_free_string(ptr::null_mut());
            usm_destroy(ptr::null_mut());
            // Should not panic
        }
    }

    #[test]
    fn test_create_rejects_bad_config() {
        let (_dir, path) = write_config("templates: [oops");
        let missing = CString::new("/nonexistent/usm/services.yaml").unwrap();
        unsafe {
            assert!(usm_create(path.as_ptr()).is_null());
            assert!(usm_create(missing.as_ptr()).is_null());
        }
    }

    #[test]
    fn test_handle_is_invalid_after_destroy() {
        let (_dir, path) = write_config("templates: []\n");
        let id = CString::new("web-1").unwrap();
        unsafe {
            let handle = usm_create(path.as_ptr());
            assert!(!handle.is_null());
            assert_eq!(usm_start_service(handle, id.as_ptr()), -4);
            assert_eq!(usm_start_service(handle, ptr::null()), -3);

            usm_destroy(handle);
            assert_eq!(usm_start_service(handle, id.as_ptr()), -2);
            assert!(usm_get_services(handle).is_null());
            // Destroying twice is ignored.
            usm_destroy(handle);
        }
    }

    #[test]
    fn test_service_array_double_free_is_ignored() {
        let (_dir, path) = write_config(
            "templates:\n  - id: web\n    display_name: Web\n    command: sleep\n    default_port: 8080\ninstances:\n  - id: web-1\n    template: web\n",
        );
        unsafe {
            let handle = usm_create(path.as_ptr());
            let array = usm_get_services(handle);
            assert!(!array.is_null());
            assert_eq!((*array).len, 1);

            let info = &*(*array).data;
            assert_eq!(CStr::from_ptr(info.id).to_str().unwrap(), "web-1");
            assert_eq!(CStr::from_ptr(info.template_id).to_str().unwrap(), "web");
            assert_eq!(CStr::from_ptr(info.display_name).to_str().unwrap(), "Web");
            assert_eq!(info.port, 8080);
            assert_eq!(info.status, USM_STATUS_STOPPED);

            usm_free_services(array);
            usm_free_services(array);
            usm_destroy(handle);
        }
    }

    #[test]
    fn test_health_endpoint_uses_instance_port() {
        let (_dir, path) = write_config(
            "templates:\n  - id: api\n    display_name: API\n    command: sleep\n    default_port: 8080\n    health_endpoint: http://localhost:{port}/health\n  - id: worker\n    display_name: Worker\n    command: sleep\n    default_port: 9000\ninstances:\n  - id: api-1\n    template: api\n    port: 8085\n  - id: worker-1\n    template: worker\n",
        );
        let api = CString::new("api-1").unwrap();
        let worker = CString::new("worker-1").unwrap();
        let missing = CString::new("nope").unwrap();
        unsafe {
            let handle = usm_create(path.as_ptr());
            let url = usm_service_health_endpoint(handle, api.as_ptr());
            assert_eq!(
                CStr::from_ptr(url).to_str().unwrap(),
                "http://localhost:8085/health"
            );
            usm_free_string(url);

            assert!(usm_service_health_endpoint(handle, worker.as_ptr()).is_null());
            assert!(usm_service_health_endpoint(handle, missing.as_ptr()).is_null());
            assert!(usm_service_health_endpoint(ptr::null(), api.as_ptr()).is_null());
            usm_destroy(handle);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_full_flow_with_real_process() {
        let port = std::net::TcpListener::bind(("127.0.0.1", 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let yaml = format!(
            "manager:\n  grace_timeout_ms: 2000\ntemplates:\n  - id: sleeper\n    display_name: Sleeper\n    command: sleep\n    args: [\"30\"]\n    default_port: {port}\n"
        );
        let (_dir, path) = write_config(&yaml);
        let id = CString::new("sleeper-1").unwrap();
        let missing = CString::new("nope").unwrap();

        unsafe {
            let handle = usm_create(path.as_ptr());
            assert!(!handle.is_null());

            assert_eq!(usm_start_service(handle, id.as_ptr()), 0);
            assert_eq!(usm_start_service(handle, id.as_ptr()), -5);
            assert_eq!(usm_refresh_services(handle), 0);

            let array = usm_get_services(handle);
            assert_eq!((*array).len, 1);
            let info = &*(*array).data;
            assert_eq!(info.status, USM_STATUS_RUNNING);
            assert_eq!(info.port, port);
            usm_free_services(array);

            assert_eq!(usm_restart_service(handle, id.as_ptr()), 0);
            assert_eq!(usm_deregister_service(handle, id.as_ptr()), -5);
            assert_eq!(usm_stop_service(handle, id.as_ptr()), 0);
            assert_eq!(usm_stop_service(handle, id.as_ptr()), -6);
            assert!(usm_service_error(handle, id.as_ptr()).is_null());
            assert!(usm_service_error(handle, missing.as_ptr()).is_null());

            let metrics = usm_metrics_json(handle);
            let json: serde_json::Value =
                serde_json::from_str(CStr::from_ptr(metrics).to_str().unwrap()).unwrap();
            assert_eq!(json["starts_total"], 2);
            assert_eq!(json["restarts_total"], 1);
            usm_free_string(metrics);

            assert_eq!(usm_deregister_service(handle, id.as_ptr()), 0);
            usm_destroy(handle);
        }
    }
}
