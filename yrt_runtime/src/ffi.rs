use std::borrow::Cow;
use std::ffi::CStr;

use libc::c_char;

/// A NUL-terminated string handed over by generated code. Null reads as
/// `"??"` so diagnostics never fault on missing provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct FFIStr(*const c_char);

impl FFIStr {
    pub const fn from_ptr(ptr: *const c_char) -> Self {
        Self(ptr)
    }

    pub const fn null() -> Self {
        Self(std::ptr::null())
    }

    pub fn as_ptr(&self) -> *const c_char {
        self.0
    }

    /// # Safety
    /// The pointer must be null or point to a NUL-terminated string that
    /// outlives the returned value.
    pub unsafe fn to_str_lossy<'a>(self) -> Cow<'a, str> {
        if self.0.is_null() {
            Cow::Borrowed("??")
        } else {
            CStr::from_ptr(self.0).to_string_lossy()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::FFIStr;

    #[test]
    fn lossy() {
        let s = b"main.yr\0";
        let ffi = FFIStr::from_ptr(s.as_ptr().cast());
        assert_eq!(unsafe { ffi.to_str_lossy() }, "main.yr");
        assert_eq!(unsafe { FFIStr::null().to_str_lossy() }, "??");
    }
}
