//! C ABI over one process-wide [`Manager`].
//!
//! The export names match the DLL the terminal scripts already import, so
//! this library drops in without touching them. Every call returns `0` on
//! success and `-1` on failure; `zmq_get_last_error` explains the failure.
//! A receive that simply times out also returns `-1` but leaves the last
//! error untouched.

mod strings;

use std::ffi::c_int;
use std::path::Path;
use std::sync::Once;
use std::time::Duration;

use lazy_static::lazy_static;
use mtbridge_pubsub::{BridgeConfig, BridgeError, Handle, Manager};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use crate::strings::{read_wide, write_wide};

/// Path of an optional TOML config read once at load.
pub const CONFIG_ENV: &str = "MTBRIDGE_CONFIG";
/// Log filter for the library, e.g. `mtbridge_pubsub=debug`.
pub const LOG_ENV: &str = "MTBRIDGE_LOG";

const OK: c_int = 0;
const FAILED: c_int = -1;

static LOGGING: Once = Once::new();

lazy_static! {
    static ref MANAGER: Manager = {
        init_logging();
        Manager::new(load_config())
    };
}

fn init_logging() {
    LOGGING.call_once(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
        // The host process may already own a global subscriber.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init();
    });
}

fn load_config() -> BridgeConfig {
    let Some(path) = std::env::var_os(CONFIG_ENV) else {
        return BridgeConfig::default();
    };
    match BridgeConfig::load(Path::new(&path)) {
        Ok(config) => config,
        Err(e) => {
            warn!(path = ?path, error = %e, "Ignoring bridge config, using defaults");
            BridgeConfig::default()
        }
    }
}

fn status<T>(result: Result<T, BridgeError>) -> c_int {
    match result {
        Ok(_) => OK,
        Err(_) => FAILED,
    }
}

/// Resolve a caller-supplied handle, recording a failure for values that can
/// never have been issued.
fn handle(raw: c_int) -> Option<Handle> {
    let handle = Handle::from_raw(raw);
    if handle.is_none() {
        MANAGER.set_last_error(&BridgeError::invalid_handle(raw, "not a valid handle"));
    }
    handle
}

/// Creation calls auto-initialize, as the terminal scripts rely on it.
fn ensure_init() -> Result<(), BridgeError> {
    if MANAGER.is_initialized() {
        Ok(())
    } else {
        debug!("Auto-initializing bridge");
        MANAGER.init()
    }
}

fn millis(timeout_ms: c_int) -> Duration {
    Duration::from_millis(u64::try_from(timeout_ms).unwrap_or(0))
}

#[no_mangle]
pub extern "C" fn zmq_init() -> c_int {
    status(MANAGER.init())
}

#[no_mangle]
pub extern "C" fn zmq_term() {
    MANAGER.terminate();
}

/// Returns the new handle, or -1.
///
/// # Safety
/// `address` must be null or a NUL-terminated UTF-16 string.
#[no_mangle]
pub unsafe extern "C" fn zmq_create_publisher(address: *const u16) -> c_int {
    let address = read_wide(address);
    match ensure_init().and_then(|()| MANAGER.create_publisher(&address)) {
        Ok(h) => h.as_raw(),
        Err(_) => FAILED,
    }
}

/// Returns the new handle, or -1.
///
/// # Safety
/// `address` must be null or a NUL-terminated UTF-16 string.
#[no_mangle]
pub unsafe extern "C" fn zmq_create_subscriber(address: *const u16) -> c_int {
    let address = read_wide(address);
    match ensure_init().and_then(|()| MANAGER.create_subscriber(&address)) {
        Ok(h) => h.as_raw(),
        Err(_) => FAILED,
    }
}

/// # Safety
/// `topic` must be null or a NUL-terminated UTF-16 string.
#[no_mangle]
pub unsafe extern "C" fn zmq_subscribe(handle_raw: c_int, topic: *const u16) -> c_int {
    let Some(h) = handle(handle_raw) else {
        return FAILED;
    };
    let topic = read_wide(topic);
    status(MANAGER.subscribe(h, topic.as_bytes()))
}

/// # Safety
/// `topic` and `message` must each be null or a NUL-terminated UTF-16 string.
#[no_mangle]
pub unsafe extern "C" fn zmq_send_message(
    handle_raw: c_int,
    topic: *const u16,
    message: *const u16,
) -> c_int {
    let Some(h) = handle(handle_raw) else {
        return FAILED;
    };
    let topic = read_wide(topic);
    let message = read_wide(message);
    status(MANAGER.send(h, topic.as_bytes(), message.as_bytes()))
}

/// Wait up to `timeout_ms` for a message and copy it out. Negative timeouts
/// poll once.
///
/// # Safety
/// `topic_buf` must be null or valid for `topic_len` `u16` writes, and the
/// same for `message_buf` and `message_len`.
#[no_mangle]
pub unsafe extern "C" fn zmq_recv_message(
    handle_raw: c_int,
    topic_buf: *mut u16,
    topic_len: c_int,
    message_buf: *mut u16,
    message_len: c_int,
    timeout_ms: c_int,
) -> c_int {
    let Some(h) = handle(handle_raw) else {
        return FAILED;
    };
    match MANAGER.receive(h, millis(timeout_ms)) {
        Ok(msg) => {
            write_wide(&msg.topic_str(), topic_buf, topic_len);
            write_wide(&msg.payload_str(), message_buf, message_len);
            OK
        }
        Err(_) => FAILED,
    }
}

/// Returns 1 if a receive would make progress, 0 if not, -1 on error.
#[no_mangle]
pub extern "C" fn zmq_poll_socket(handle_raw: c_int, timeout_ms: c_int) -> c_int {
    let Some(h) = handle(handle_raw) else {
        return FAILED;
    };
    match MANAGER.poll(h, millis(timeout_ms)) {
        Ok(true) => 1,
        Ok(false) => 0,
        Err(_) => FAILED,
    }
}

#[no_mangle]
pub extern "C" fn zmq_close(handle_raw: c_int) -> c_int {
    let Some(h) = handle(handle_raw) else {
        return FAILED;
    };
    status(MANAGER.close(h))
}

/// Copy the last error into `buf`. Returns the UTF-16 units written.
///
/// # Safety
/// `buf` must be null or valid for `len` `u16` writes.
#[no_mangle]
pub unsafe extern "C" fn zmq_get_last_error(buf: *mut u16, len: c_int) -> c_int {
    write_wide(&MANAGER.last_error(), buf, len)
}

/// Copy the library version into `buf`. Returns the UTF-16 units written.
///
/// # Safety
/// `buf` must be null or valid for `len` `u16` writes.
#[no_mangle]
pub unsafe extern "C" fn zmq_version(buf: *mut u16, len: c_int) -> c_int {
    write_wide(mtbridge_pubsub::version(), buf, len)
}
