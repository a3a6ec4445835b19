//! C FFI interface
//!
//! Exposes the stateless parts of the library (link translation, quality
//! scoring, rate formatting) to hosts written in other languages. Session
//! control stays on the Rust side, where the host plugs in its engine and
//! interface capabilities.

#![allow(clippy::missing_safety_doc)]

use std::ffi::CStr;
use std::os::raw::{c_char, c_int};
use std::ptr;

use crate::error::{ParseError, TunError};
use crate::link;
use crate::monitor::format_rate;
use crate::profiler::quality_score;

/// Status codes returned by C FFI functions
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunStatus {
    Success = 0,
    UnsupportedProtocol = 1,
    MalformedPayload = 2,
    MissingCredential = 3,
    MissingHost = 4,
    InvalidParameter = 5,
    BufferTooSmall = 7,
    InternalError = 99,
}

impl From<&ParseError> for TunStatus {
    fn from(error: &ParseError) -> Self {
        match error {
            ParseError::UnsupportedProtocol(_) => TunStatus::UnsupportedProtocol,
            ParseError::MalformedPayload(_) => TunStatus::MalformedPayload,
            ParseError::MissingCredential => TunStatus::MissingCredential,
            ParseError::MissingHost => TunStatus::MissingHost,
        }
    }
}

impl From<&TunError> for TunStatus {
    fn from(error: &TunError) -> Self {
        match error {
            TunError::Parse(e) => TunStatus::from(e),
            _ => TunStatus::InternalError,
        }
    }
}

/// Copy `value` plus a terminating NUL into `out`. Returns false (writing
/// nothing) if it does not fit.
unsafe fn write_c_string(value: &str, out: *mut c_char, out_len: usize) -> bool {
    let bytes = value.as_bytes();
    if out.is_null() || bytes.contains(&0) || bytes.len() + 1 > out_len {
        return false;
    }
    ptr::copy_nonoverlapping(bytes.as_ptr() as *const c_char, out, bytes.len());
    *out.add(bytes.len()) = 0;
    true
}

/// Copy as much of `value` as fits, always NUL terminated
unsafe fn write_truncated(value: &str, out: *mut c_char, out_len: usize) {
    if out.is_null() || out_len == 0 {
        return;
    }
    let bytes = value.as_bytes();
    let copy_len = std::cmp::min(bytes.len(), out_len - 1);
    ptr::copy_nonoverlapping(bytes.as_ptr() as *const c_char, out, copy_len);
    *out.add(copy_len) = 0;
}

/// Translate a `vless://` / `vmess://` link or a JSON document into the
/// engine configuration document
///
/// # Parameters
/// - `input`: NUL-terminated link or document
/// - `out`: Output buffer for the document, or the error message on failure
/// - `out_len`: Size of the output buffer
///
/// # Returns
/// - 0 on success
/// - `TunStatus` code on failure
#[no_mangle]
pub unsafe extern "C" fn tunsession_translate(
    input: *const c_char,
    out: *mut c_char,
    out_len: usize,
) -> c_int {
    if input.is_null() || out.is_null() || out_len == 0 {
        return TunStatus::InvalidParameter as c_int;
    }

    let input = match CStr::from_ptr(input).to_str() {
        Ok(s) => s,
        Err(_) => return TunStatus::InvalidParameter as c_int,
    };

    match link::translate(input) {
        Ok(config) => {
            if write_c_string(&config.to_json(), out, out_len) {
                TunStatus::Success as c_int
            } else {
                TunStatus::BufferTooSmall as c_int
            }
        }
        Err(err) => {
            write_truncated(&err.to_string(), out, out_len);
            TunStatus::from(&err) as c_int
        }
    }
}

/// Quality score (0-100) for the given measurements
#[no_mangle]
pub extern "C" fn tunsession_quality_score(
    latency_ms: f64,
    jitter_ms: f64,
    packet_loss_percent: f64,
) -> c_int {
    c_int::from(quality_score(latency_ms, jitter_ms, packet_loss_percent))
}

/// Format a byte rate such as `1.5 MB/s` into `out`
///
/// # Returns
/// - 0 on success
/// - `TunStatus` code on failure
#[no_mangle]
pub unsafe extern "C" fn tunsession_format_rate(
    bytes_per_sec: u64,
    out: *mut c_char,
    out_len: usize,
) -> c_int {
    if out.is_null() || out_len == 0 {
        return TunStatus::InvalidParameter as c_int;
    }
    if write_c_string(&format_rate(bytes_per_sec), out, out_len) {
        TunStatus::Success as c_int
    } else {
        TunStatus::BufferTooSmall as c_int
    }
}

/// Get library version
#[no_mangle]
pub extern "C" fn tunsession_version() -> *const c_char {
    static VERSION_CSTR: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION_CSTR.as_ptr() as *const c_char
}
