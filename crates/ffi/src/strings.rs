//! UTF-16 marshalling. The terminal passes and expects NUL-terminated
//! `wchar_t` strings; the wire carries UTF-8.

use std::ffi::c_int;

/// Longest string read from the caller, in UTF-16 units.
const MAX_WIDE_LEN: usize = 1 << 20;

/// Read a NUL-terminated UTF-16 string. Null reads as empty; invalid
/// surrogates are replaced.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated UTF-16 buffer (or one at
/// least `MAX_WIDE_LEN` units long).
pub unsafe fn read_wide(ptr: *const u16) -> String {
    if ptr.is_null() {
        return String::new();
    }
    let mut len = 0;
    while len < MAX_WIDE_LEN && *ptr.add(len) != 0 {
        len += 1;
    }
    String::from_utf16_lossy(std::slice::from_raw_parts(ptr, len))
}

/// Copy `s` into a caller buffer of `capacity` units, truncating as needed
/// and always NUL-terminating. Returns the units written, excluding the NUL.
///
/// # Safety
/// `buf` must be null or valid for `capacity` writes of `u16`.
pub unsafe fn write_wide(s: &str, buf: *mut u16, capacity: c_int) -> c_int {
    let capacity = match usize::try_from(capacity) {
        Ok(cap) if cap > 0 && !buf.is_null() => cap,
        _ => return 0,
    };
    let out = std::slice::from_raw_parts_mut(buf, capacity);

    let mut written = 0;
    for unit in s.encode_utf16() {
        if written + 1 >= capacity {
            break;
        }
        out[written] = unit;
        written += 1;
    }
    // Never leave half of a surrogate pair behind.
    if written > 0 && (0xD800..0xDC00).contains(&out[written - 1]) {
        written -= 1;
    }
    out[written] = 0;
    written as c_int
}

#[cfg(test)]
pub(crate) fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_wide() {
        let buf = wide("tcp://*:5556");
        assert_eq!(unsafe { read_wide(buf.as_ptr()) }, "tcp://*:5556");
        assert_eq!(unsafe { read_wide(std::ptr::null()) }, "");
    }

    #[test]
    fn test_write_wide_fits() {
        let mut buf = [0xFFFFu16; 16];
        let n = unsafe { write_wide("EURUSD", buf.as_mut_ptr(), 16) };
        assert_eq!(n, 6);
        assert_eq!(unsafe { read_wide(buf.as_ptr()) }, "EURUSD");
    }

    #[test]
    fn test_write_wide_truncates() {
        let mut buf = [0xFFFFu16; 4];
        let n = unsafe { write_wide("EURUSD", buf.as_mut_ptr(), 4) };
        assert_eq!(n, 3);
        assert_eq!(unsafe { read_wide(buf.as_ptr()) }, "EUR");
    }

    #[test]
    fn test_write_wide_keeps_surrogates_whole() {
        // U+1F4C8 needs two UTF-16 units.
        let mut buf = [0xFFFFu16; 3];
        let n = unsafe { write_wide("a\u{1F4C8}", buf.as_mut_ptr(), 3) };
        assert_eq!(n, 1);
        assert_eq!(buf[1], 0);
    }

    #[test]
    fn test_write_wide_rejects_bad_buffers() {
        assert_eq!(unsafe { write_wide("x", std::ptr::null_mut(), 8) }, 0);
        let mut buf = [0u16; 1];
        assert_eq!(unsafe { write_wide("x", buf.as_mut_ptr(), 0) }, 0);
        assert_eq!(unsafe { write_wide("x", buf.as_mut_ptr(), -3) }, 0);
    }
}
