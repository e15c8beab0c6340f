//! Entry points called by generated code: throw, begin-catch and resume, plus
//! the cleanup callback the unwinder runs when it destroys an exception.

use std::ptr::NonNull;

use libc::{c_char, c_uint};
use yrt_unwind as uw;

use crate::error::{EhError, Result};
use crate::ffi::FFIStr;
use crate::panic;
use crate::thread::ThreadId;

use super::header::{ExceptionHeader, ExceptionObject};
use super::registry::{self, Registry};

/// Creates the header for a new exception of thread `id` and makes it the
/// innermost one in flight.
///
/// # Safety
/// Must run on the thread `id` names.
pub unsafe fn prepare_throw(
    registry: &Registry,
    id: ThreadId,
    file: FFIStr,
    function: FFIStr,
    line: c_uint,
    object: *mut ExceptionObject,
) -> Result<NonNull<ExceptionHeader>> {
    let node = registry.get_or_create(id);
    let stack = node.as_ref();

    let header = stack.create_header(object)?;
    {
        let h = &mut *header.as_ptr();
        h.file = file;
        h.function = function;
        h.line = line;
        h.unwind_header.exception_cleanup = Some(exception_cleanup);
    }
    stack.push(header);

    log::trace!(
        "throw {:p} from {}:{} ({:?})",
        header.as_ptr(),
        file.to_str_lossy(),
        line,
        id
    );
    Ok(header)
}

/// Retires the innermost exception of thread `id`, which must be `header`,
/// and hands back its payload. The header itself stays alive until the
/// unwinder deletes it.
///
/// # Safety
/// Must run on the thread `id` names.
pub unsafe fn finish_catch(registry: &Registry, id: ThreadId, header: *mut ExceptionHeader) -> Result<*mut ExceptionObject> {
    let node = registry.find(id).ok_or(EhError::NothingInFlight)?;
    node.as_ref().pop_expecting(header)?;

    log::trace!("caught {:p}", header);
    Ok((*header).object)
}

/// Gives `header` back to the stack of the thread that threw it.
///
/// # Safety
/// `header` must come from [`prepare_throw`] and must not be used afterwards.
pub unsafe fn retire(registry: &Registry, header: NonNull<ExceptionHeader>) -> Result<()> {
    let id = header.as_ref().thread_id;
    let node = registry.find(id).ok_or(EhError::UnknownThread)?;
    registry.free_header(node, header);
    Ok(())
}

unsafe extern "C" fn exception_cleanup(code: uw::_Unwind_Reason_Code, exception: *mut uw::_Unwind_Exception) {
    let header = ExceptionHeader::from_unwind(exception);
    if code != uw::_URC_FOREIGN_EXCEPTION_CAUGHT && code != uw::_URC_NO_REASON {
        panic::panic_uncaught(&*header);
    }

    let result = match NonNull::new(header) {
        Some(header) => retire(registry::global(), header),
        None => Err(EhError::NothingInFlight),
    };
    if let Err(err) = result {
        panic::fatal(&err, "exception_cleanup");
    }
}

#[no_mangle]
pub unsafe extern "C" fn _yrt_exc_throw(
    file: *const c_char,
    function: *const c_char,
    line: c_uint,
    object: *mut ExceptionObject,
) -> ! {
    let header = match prepare_throw(
        registry::global(),
        ThreadId::current(),
        FFIStr::from_ptr(file),
        FFIStr::from_ptr(function),
        line,
        object,
    ) {
        Ok(header) => header,
        Err(err) => panic::fatal(&err, "_yrt_exc_throw"),
    };

    let code = uw::_Unwind_RaiseException(ExceptionHeader::as_unwind(header.as_ptr()));
    if code == uw::_URC_END_OF_STACK {
        panic::panic_uncaught(header.as_ref());
    }
    panic::fatal(&EhError::UnexpectedUnwindResult(code), "_yrt_exc_throw")
}

#[no_mangle]
pub unsafe extern "C" fn _yrt_exc_begin_catch(exception: *mut uw::_Unwind_Exception) -> *mut ExceptionObject {
    let header = ExceptionHeader::from_unwind(exception);
    let object = match finish_catch(registry::global(), ThreadId::current(), header) {
        Ok(object) => object,
        Err(err) => panic::fatal(&err, "_yrt_exc_begin_catch"),
    };

    // runs `exception_cleanup`, which returns the header to its stack
    uw::_Unwind_DeleteException(exception);
    object
}

/// Continues unwinding after a cleanup-only landing pad.
#[no_mangle]
pub unsafe extern "C" fn _yrt_exc_resume(exception: *mut uw::_Unwind_Exception) -> ! {
    uw::_Unwind_Resume(exception)
}
