use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::panic;

pub const DEFAULT_MAX_TRACE_LEN: usize = 128;

/// Process-wide runtime settings, applied once by [`init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeOptions {
    /// Capture and print stack traces in fatal diagnostics.
    pub debug: bool,
    /// Deepest trace captured, in frames.
    pub max_trace_len: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            debug: false,
            max_trace_len: DEFAULT_MAX_TRACE_LEN,
        }
    }
}

static DEBUG: AtomicBool = AtomicBool::new(false);
static SAVED_DEBUG: AtomicBool = AtomicBool::new(false);
static MAX_TRACE_LEN: AtomicUsize = AtomicUsize::new(DEFAULT_MAX_TRACE_LEN);

pub fn apply(options: RuntimeOptions) {
    DEBUG.store(options.debug, Ordering::Relaxed);
    MAX_TRACE_LEN.store(options.max_trace_len, Ordering::Relaxed);
}

pub fn current() -> RuntimeOptions {
    RuntimeOptions {
        debug: DEBUG.load(Ordering::Relaxed),
        max_trace_len: MAX_TRACE_LEN.load(Ordering::Relaxed),
    }
}

/// Applies `options` and installs the segmentation fault handler.
pub fn init(options: RuntimeOptions) -> io::Result<()> {
    apply(options);
    log::debug!("exception runtime initialized with {:?}", options);
    panic::install_fault_handler()
}

/// Forces tracing on until `force_debug(false)` puts the previous setting
/// back.
pub fn force_debug(on: bool) {
    if on {
        SAVED_DEBUG.store(DEBUG.load(Ordering::Relaxed), Ordering::Relaxed);
        DEBUG.store(true, Ordering::Relaxed);
    } else {
        DEBUG.store(SAVED_DEBUG.load(Ordering::Relaxed), Ordering::Relaxed);
    }
}

pub fn trace_enabled() -> bool {
    DEBUG.load(Ordering::Relaxed)
}

pub fn max_trace_len() -> usize {
    MAX_TRACE_LEN.load(Ordering::Relaxed)
}

fn init_or_report(options: RuntimeOptions) {
    if let Err(err) = init(options) {
        eprintln!("cannot install the segmentation fault handler: {}", err);
    }
}

#[no_mangle]
pub extern "C" fn _yrt_exc_init() {
    init_or_report(RuntimeOptions::default());
}

#[no_mangle]
pub extern "C" fn _yrt_exc_init_debug() {
    init_or_report(RuntimeOptions {
        debug: true,
        ..RuntimeOptions::default()
    });
}

#[no_mangle]
pub extern "C" fn _yrt_force_debug(act: libc::c_int) {
    force_debug(act != 0);
}
