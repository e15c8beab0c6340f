//! Fatal paths. Everything here ends the process with `abort`.

use std::cell::RefCell;
use std::fmt::Display;
use std::io::{self, Write};
use std::mem;
use std::panic::Location;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use libc::{c_char, c_int, c_uint, c_void};

use crate::eh::header::ExceptionHeader;
use crate::ffi::FFIStr;
use crate::stacktrace;

/// Claimed by the first fatal path to run.
static TERMINATING: AtomicBool = AtomicBool::new(false);

fn print_trace(out: &mut impl Write) {
    let trace = stacktrace::current_trace();
    if !trace.is_empty() {
        let _ = writeln!(out, "{}", trace);
    }
}

pub fn terminate_message(msg: &str, file: &str, function: &str, line: u32) -> String {
    format!("terminate ({}/{}:{}): {}", file, function, line, msg)
}

pub fn panic_message(file: &str, function: &str, line: u32) -> String {
    format!(
        "Panic in file \"{}\", at line {}, in function \"{}\" !!! ",
        file, line, function
    )
}

pub fn uncaught_message(file: &str, function: &str, line: u32) -> String {
    format!(
        "Uncaught exception in file \"{}\", at line {}, in function \"{}\"",
        file, line, function
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    First,
    Recursive,
}

fn enter(guard: &AtomicBool) -> Entry {
    match guard.swap(true, Ordering::SeqCst) {
        false => Entry::First,
        true => Entry::Recursive,
    }
}

/// Claims the termination path. Reaching it again, from any fatal path,
/// aborts at once without a trace.
fn begin_termination() {
    if enter(&TERMINATING) == Entry::Recursive {
        // stderr may still be locked by the first caller
        write_stderr(b"terminating called recursively\n");
        std::process::abort();
    }
}

/// Irrecoverable runtime error.
pub fn terminate(msg: &str, file: &str, function: &str, line: u32) -> ! {
    begin_termination();

    let mut stderr = io::stderr().lock();
    let _ = writeln!(stderr, "{}", terminate_message(msg, file, function, line));
    print_trace(&mut stderr);
    std::process::abort();
}

/// [`terminate`] with `err` as message, located at the caller.
#[track_caller]
pub fn fatal(err: &dyn Display, function: &str) -> ! {
    let location = Location::caller();
    terminate(&err.to_string(), location.file(), function, location.line())
}

pub fn panic_at(file: &str, function: &str, line: u32) -> ! {
    begin_termination();
    let mut stderr = io::stderr().lock();
    let _ = writeln!(stderr, "{}", panic_message(file, function, line));
    print_trace(&mut stderr);
    std::process::abort();
}

/// An exception reached the end of the stack.
pub fn panic_uncaught(header: &ExceptionHeader) -> ! {
    // SAFETY: provenance strings come from generated code and live forever
    let (file, function) = unsafe { (header.file.to_str_lossy(), header.function.to_str_lossy()) };
    begin_termination();
    let mut stderr = io::stderr().lock();
    let _ = writeln!(stderr, "{}", uncaught_message(&file, &function, header.line));
    print_trace(&mut stderr);
    std::process::abort();
}

fn write_stderr(msg: &[u8]) {
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.as_ptr() as *const c_void, msg.len());
    }
}

/// Reports a segmentation fault with a trace, or without one when the
/// process is already terminating.
pub fn panic_seg_fault() -> ! {
    if enter(&TERMINATING) == Entry::Recursive {
        panic_no_trace();
    }

    write_stderr(b"Segfault - ");
    let trace = stacktrace::current_trace();
    if !trace.is_empty() {
        write_stderr(trace.as_bytes());
        write_stderr(b"\n");
    }
    write_stderr(b"\n");
    std::process::abort();
}

pub fn panic_no_trace() -> ! {
    write_stderr(b"Panic during stacktrace !");
    std::process::abort();
}

extern "C" fn fault_handler(_signum: c_int, _siginfo: *mut libc::siginfo_t, _context: *mut c_void) {
    // a fault inside the trace lands here again and degrades to the trace-free
    // panic
    panic_seg_fault()
}

/// Alternate signal stack the fault handler runs on, guard page excluded.
/// Symbolizing a trace needs far more than the `SIGSTKSZ` stack std installs.
const ALT_STACK_SIZE: usize = 256 * 4096;

enum AltStack {
    None,
    Allocated { mmap_ptr: *mut c_void, mmap_size: usize },
    BigEnough,
}

impl Drop for AltStack {
    fn drop(&mut self) {
        if let Self::Allocated { mmap_ptr, mmap_size } = *self {
            unsafe {
                let disable = libc::stack_t {
                    ss_sp: ptr::null_mut(),
                    ss_flags: libc::SS_DISABLE,
                    ss_size: ALT_STACK_SIZE,
                };
                libc::sigaltstack(&disable, ptr::null_mut());
                libc::munmap(mmap_ptr, mmap_size);
            }
        }
    }
}

thread_local! {
    static ALT_STACK: RefCell<AltStack> = RefCell::new(AltStack::None);
}

/// Gives the calling thread an alternate signal stack of at least
/// [`ALT_STACK_SIZE`] bytes, keeping the current one when it is big enough.
fn ensure_alt_stack() -> io::Result<()> {
    ALT_STACK.with(|slot| unsafe {
        let mut slot = slot.borrow_mut();
        if !matches!(*slot, AltStack::None) {
            return Ok(());
        }

        let mut old_stack: libc::stack_t = mem::zeroed();
        if libc::sigaltstack(ptr::null(), &mut old_stack) != 0 {
            return Err(io::Error::last_os_error());
        }
        if old_stack.ss_flags & libc::SS_DISABLE == 0 && old_stack.ss_size >= ALT_STACK_SIZE {
            *slot = AltStack::BigEnough;
            return Ok(());
        }

        let guard_size = libc::sysconf(libc::_SC_PAGESIZE) as usize;
        let mmap_size = guard_size + ALT_STACK_SIZE;
        let mmap_ptr = libc::mmap(
            ptr::null_mut(),
            mmap_size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        );
        if mmap_ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let stack_ptr = (mmap_ptr as usize + guard_size) as *mut c_void;
        if libc::mprotect(stack_ptr, ALT_STACK_SIZE, libc::PROT_READ | libc::PROT_WRITE) != 0 {
            let err = io::Error::last_os_error();
            libc::munmap(mmap_ptr, mmap_size);
            return Err(err);
        }
        let new_stack = libc::stack_t {
            ss_sp: stack_ptr,
            ss_flags: 0,
            ss_size: ALT_STACK_SIZE,
        };
        if libc::sigaltstack(&new_stack, ptr::null_mut()) != 0 {
            let err = io::Error::last_os_error();
            libc::munmap(mmap_ptr, mmap_size);
            return Err(err);
        }

        *slot = AltStack::Allocated { mmap_ptr, mmap_size };
        Ok(())
    })
}

/// Routes `SIGSEGV` to [`panic_seg_fault`]. The handler runs on an alternate
/// stack set up for the calling thread, so faults on other threads only get
/// it if their own alternate stack is large enough.
pub fn install_fault_handler() -> io::Result<()> {
    ensure_alt_stack()?;
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER | libc::SA_ONSTACK;
        action.sa_sigaction = fault_handler as *const () as libc::sighandler_t;
        libc::sigemptyset(&mut action.sa_mask);

        if libc::sigaction(libc::SIGSEGV, &action, ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    log::debug!("installed SIGSEGV handler");
    Ok(())
}

#[no_mangle]
pub unsafe extern "C" fn _yrt_exc_terminate(
    msg: *const c_char,
    file: *const c_char,
    function: *const c_char,
    line: c_uint,
) -> ! {
    let msg = FFIStr::from_ptr(msg).to_str_lossy();
    let file = FFIStr::from_ptr(file).to_str_lossy();
    let function = FFIStr::from_ptr(function).to_str_lossy();
    terminate(&msg, &file, &function, line)
}

#[no_mangle]
pub unsafe extern "C" fn _yrt_exc_panic(file: *const c_char, function: *const c_char, line: c_uint) -> ! {
    let file = FFIStr::from_ptr(file).to_str_lossy();
    let function = FFIStr::from_ptr(function).to_str_lossy();
    panic_at(&file, &function, line)
}

#[no_mangle]
pub extern "C" fn _yrt_exc_panic_seg_fault() -> ! {
    panic_seg_fault()
}

#[no_mangle]
pub extern "C" fn _yrt_exc_panic_no_trace() -> ! {
    panic_no_trace()
}

#[cfg(test)]
pub(crate) mod tests {
    use std::env;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{Command, ExitStatus};

    use super::*;
    use crate::config::{self, RuntimeOptions};

    const CHILD_ENV: &str = "YRT_FATAL_CHILD";

    /// True inside the copy of the test binary started by [`run_in_child`].
    pub(crate) fn in_child() -> bool {
        env::var_os(CHILD_ENV).is_some()
    }

    /// Reruns the test named `test` alone in a new process and returns its
    /// exit status and stderr.
    pub(crate) fn run_in_child(test: &str) -> (ExitStatus, String) {
        let output = Command::new(env::current_exe().unwrap())
            .args([test, "--exact", "--nocapture", "--test-threads=1"])
            .env(CHILD_ENV, "1")
            .output()
            .unwrap();
        (output.status, String::from_utf8_lossy(&output.stderr).into_owned())
    }

    #[test]
    fn messages() {
        assert_eq!(
            terminate_message("catch error", "protocol.rs", "_yrt_exc_begin_catch", 42),
            "terminate (protocol.rs/_yrt_exc_begin_catch:42): catch error"
        );
        assert_eq!(
            panic_message("main.yr", "main::run", 7),
            "Panic in file \"main.yr\", at line 7, in function \"main::run\" !!! "
        );
        assert_eq!(
            uncaught_message("main.yr", "main::run", 7),
            "Uncaught exception in file \"main.yr\", at line 7, in function \"main::run\""
        );
    }

    #[test]
    fn only_the_first_entry_proceeds() {
        let guard = AtomicBool::new(false);
        assert_eq!(enter(&guard), Entry::First);
        assert_eq!(enter(&guard), Entry::Recursive);
        assert_eq!(enter(&guard), Entry::Recursive);
    }

    #[test]
    fn terminate_aborts_with_message() {
        if in_child() {
            terminate("boom", "main.yr", "main::run", 3);
        }
        let (status, stderr) = run_in_child("panic::tests::terminate_aborts_with_message");
        assert_eq!(status.signal(), Some(libc::SIGABRT));
        assert!(stderr.contains("terminate (main.yr/main::run:3): boom"));
    }

    #[test]
    fn recursive_termination_aborts() {
        if in_child() {
            begin_termination();
            terminate("second", "main.yr", "main::run", 4);
        }
        let (status, stderr) = run_in_child("panic::tests::recursive_termination_aborts");
        assert_eq!(status.signal(), Some(libc::SIGABRT));
        assert!(stderr.contains("terminating called recursively"));
        assert!(!stderr.contains("terminate (main.yr"));
    }

    #[test]
    fn panic_after_terminate_aborts() {
        if in_child() {
            begin_termination();
            panic_at("main.yr", "main::run", 5);
        }
        let (status, stderr) = run_in_child("panic::tests::panic_after_terminate_aborts");
        assert_eq!(status.signal(), Some(libc::SIGABRT));
        assert!(stderr.contains("terminating called recursively"));
        assert!(!stderr.contains("Panic in file"));
    }

    #[test]
    fn first_fault_prints_trace() {
        if in_child() {
            config::init(RuntimeOptions {
                debug: true,
                ..RuntimeOptions::default()
            })
            .unwrap();
            unsafe { libc::raise(libc::SIGSEGV) };
            unreachable!("fault handler returned");
        }
        let (status, stderr) = run_in_child("panic::tests::first_fault_prints_trace");
        assert_eq!(status.signal(), Some(libc::SIGABRT));
        assert!(stderr.contains("Segfault - ╭  Stack trace :"));
        assert!(!stderr.contains("Panic during stacktrace"));
    }

    #[test]
    fn fault_while_terminating_skips_trace() {
        if in_child() {
            config::init(RuntimeOptions {
                debug: true,
                ..RuntimeOptions::default()
            })
            .unwrap();
            begin_termination();
            unsafe { libc::raise(libc::SIGSEGV) };
            unreachable!("fault handler returned");
        }
        let (status, stderr) = run_in_child("panic::tests::fault_while_terminating_skips_trace");
        assert_eq!(status.signal(), Some(libc::SIGABRT));
        assert!(stderr.contains("Panic during stacktrace !"));
        assert!(!stderr.contains("Segfault - "));
    }

    #[test]
    fn alt_stack_is_large_enough() {
        std::thread::spawn(|| unsafe {
            ensure_alt_stack().unwrap();
            ensure_alt_stack().unwrap();
            let mut current: libc::stack_t = mem::zeroed();
            assert_eq!(libc::sigaltstack(ptr::null(), &mut current), 0);
            assert_eq!(current.ss_flags & libc::SS_DISABLE, 0);
            assert!(current.ss_size >= ALT_STACK_SIZE);
        })
        .join()
        .unwrap();
    }
}
