use std::mem;
use std::ptr;

use libc::{c_int, c_uint};
use yrt_unwind as uw;

use crate::ffi::FFIStr;
use crate::thread::ThreadId;

/// "GNUCY\0\0\0": identifies exceptions raised by this runtime.
pub const YRT_EXCEPTION_CLASS: uw::_Unwind_Exception_Class = 0x474e_5543_5900_0000;

/// Layout prefix of every language-level exception object: chained
/// exceptions are linked through this field, oldest first.
#[repr(C)]
#[derive(Debug)]
pub struct ExceptionObject {
    pub next: *mut ExceptionObject,
}

impl ExceptionObject {
    /// Appends `newer` at the tail of `older`'s chain and returns the head.
    ///
    /// # Safety
    /// Both must be null or valid chains.
    pub unsafe fn append(older: *mut ExceptionObject, newer: *mut ExceptionObject) -> *mut ExceptionObject {
        if older.is_null() {
            return newer;
        }
        if newer.is_null() {
            return older;
        }

        let mut tail = older;
        while !(*tail).next.is_null() {
            if tail == newer {
                // already part of the chain
                return older;
            }
            tail = (*tail).next;
        }
        if tail != newer {
            (*tail).next = newer;
        }
        older
    }
}

/// What phase 1 committed to for the frame that will catch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerRecord {
    pub handler: c_int,
    pub lsda: *const u8,
    pub landing_pad: usize,
    pub cfa: usize,
}

/// One in-flight exception. The unwinder's `_Unwind_Exception` comes first,
/// so a pointer to a header and a pointer to its `unwind_header` are the same
/// address.
#[repr(C)]
pub struct ExceptionHeader {
    pub unwind_header: uw::_Unwind_Exception,

    pub object: *mut ExceptionObject,
    pub thread_id: ThreadId,

    pub file: FFIStr,
    pub function: FFIStr,
    pub line: c_uint,

    // written in phase 1, read back in phase 2
    handler: c_int,
    lsda: *const u8,
    landing_pad: usize,
    cfa: usize,

    /// Next older exception in flight on the same thread.
    pub(crate) next: *mut ExceptionHeader,
}

impl ExceptionHeader {
    pub fn zeroed() -> Self {
        // every field is an integer, a raw pointer or an `Option` of a fn pointer
        unsafe { mem::zeroed() }
    }

    pub fn new(object: *mut ExceptionObject, thread_id: ThreadId) -> Self {
        Self {
            unwind_header: uw::_Unwind_Exception::new(YRT_EXCEPTION_CLASS),
            object,
            thread_id,
            ..Self::zeroed()
        }
    }

    pub fn from_unwind(exception: *mut uw::_Unwind_Exception) -> *mut ExceptionHeader {
        exception.cast()
    }

    pub fn as_unwind(header: *mut ExceptionHeader) -> *mut uw::_Unwind_Exception {
        // SAFETY: no reference is created, only a field address is taken
        unsafe { ptr::addr_of_mut!((*header).unwind_header) }
    }

    pub fn is_ours(&self) -> bool {
        self.unwind_header.exception_class == YRT_EXCEPTION_CLASS
    }

    pub fn next(&self) -> *mut ExceptionHeader {
        self.next
    }

    pub fn save(&mut self, record: HandlerRecord) {
        self.handler = record.handler;
        self.lsda = record.lsda;
        self.landing_pad = record.landing_pad;
        self.cfa = record.cfa;
    }

    pub fn restore(&self) -> HandlerRecord {
        HandlerRecord {
            handler: self.handler,
            lsda: self.lsda,
            landing_pad: self.landing_pad,
            cfa: self.cfa,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::mem;
    use std::ptr;

    use super::*;

    #[test]
    fn unwind_header_is_first() {
        assert_eq!(mem::offset_of!(ExceptionHeader, unwind_header), 0);

        let mut header = ExceptionHeader::new(ptr::null_mut(), ThreadId::current());
        let header_ptr: *mut ExceptionHeader = &mut header;
        let unwind = ExceptionHeader::as_unwind(header_ptr);
        assert_eq!(unwind as usize, header_ptr as usize);
        assert_eq!(ExceptionHeader::from_unwind(unwind), header_ptr);
    }

    #[test]
    fn new_header() {
        let mut object = ExceptionObject { next: ptr::null_mut() };
        let header = ExceptionHeader::new(&mut object, ThreadId::current());
        assert!(header.is_ours());
        assert!(header.unwind_header.exception_cleanup.is_none());
        assert_eq!(header.object, &mut object as *mut _);
        assert_eq!(header.thread_id, ThreadId::current());
        assert!(header.next().is_null());
        assert_eq!(header.restore().landing_pad, 0);
    }

    #[test]
    fn save_restore() {
        let mut header = ExceptionHeader::zeroed();
        assert!(!header.is_ours());

        let lsda = [0u8; 4];
        let record = HandlerRecord {
            handler: 2,
            lsda: lsda.as_ptr(),
            landing_pad: 0x4010,
            cfa: 0x7ff0,
        };
        header.save(record);
        assert_eq!(header.restore(), record);
    }

    #[test]
    fn append_chain() {
        let mut a = ExceptionObject { next: ptr::null_mut() };
        let mut b = ExceptionObject { next: ptr::null_mut() };
        let mut c = ExceptionObject { next: ptr::null_mut() };
        let (a, b, c): (*mut _, *mut _, *mut _) = (&mut a, &mut b, &mut c);

        unsafe {
            assert_eq!(ExceptionObject::append(ptr::null_mut(), b), b);
            assert_eq!(ExceptionObject::append(a, ptr::null_mut()), a);

            assert_eq!(ExceptionObject::append(a, b), a);
            assert_eq!(ExceptionObject::append(a, c), a);
            assert_eq!((*a).next, b);
            assert_eq!((*b).next, c);
            assert!((*c).next.is_null());

            // appending something already in the chain does not create a cycle
            assert_eq!(ExceptionObject::append(a, b), a);
            assert_eq!(ExceptionObject::append(a, c), a);
            assert!((*c).next.is_null());
        }
    }
}
