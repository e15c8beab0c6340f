//! Raw bindings to the Itanium-ABI unwinding interface (`unwind.h`).
//! Layouts follow the rust project's `library/unwind`, trimmed to what a
//! language runtime needs to raise exceptions and drive landing pads.

#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]

use libc::{c_int, c_void, uintptr_t};

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum _Unwind_Reason_Code {
    _URC_NO_REASON = 0,
    _URC_FOREIGN_EXCEPTION_CAUGHT = 1,
    _URC_FATAL_PHASE2_ERROR = 2,
    _URC_FATAL_PHASE1_ERROR = 3,
    _URC_NORMAL_STOP = 4,
    _URC_END_OF_STACK = 5,
    _URC_HANDLER_FOUND = 6,
    _URC_INSTALL_CONTEXT = 7,
    _URC_CONTINUE_UNWIND = 8,
    _URC_FAILURE = 9, // used only by ARM EHABI
}
pub use _Unwind_Reason_Code::*;

pub type _Unwind_Exception_Class = u64;
pub type _Unwind_Word = uintptr_t;
pub type _Unwind_Ptr = uintptr_t;

pub type _Unwind_Action = c_int;

pub const _UA_SEARCH_PHASE: c_int = 1;
pub const _UA_CLEANUP_PHASE: c_int = 2;
pub const _UA_HANDLER_FRAME: c_int = 4;
pub const _UA_FORCE_UNWIND: c_int = 8;
pub const _UA_END_OF_STACK: c_int = 16;

#[cfg(target_arch = "x86")]
pub const unwinder_private_data_size: usize = 5;

#[cfg(all(target_arch = "x86_64", not(target_os = "windows")))]
pub const unwinder_private_data_size: usize = 2;

#[cfg(all(target_arch = "x86_64", target_os = "windows"))]
pub const unwinder_private_data_size: usize = 6;

#[cfg(all(target_arch = "arm", not(target_vendor = "apple")))]
pub const unwinder_private_data_size: usize = 20;

#[cfg(all(target_arch = "arm", target_vendor = "apple"))]
pub const unwinder_private_data_size: usize = 5;

#[cfg(any(
    target_arch = "aarch64",
    target_arch = "riscv64",
    target_arch = "riscv32",
    target_arch = "loongarch64",
    target_arch = "powerpc64",
    target_arch = "s390x",
))]
pub const unwinder_private_data_size: usize = 2;

#[cfg(any(target_arch = "mips", target_arch = "mips64", target_arch = "powerpc"))]
pub const unwinder_private_data_size: usize = 2;

// Register ids were lifted from LLVM's TargetLowering::getExceptionPointerRegister()
// and TargetLowering::getExceptionSelectorRegister() for each architecture,
// then mapped to DWARF register numbers via register definition tables.
cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86")] {
        pub const UNWIND_DATA_REG: (c_int, c_int) = (0, 2); // EAX, EDX
    } else if #[cfg(target_arch = "x86_64")] {
        pub const UNWIND_DATA_REG: (c_int, c_int) = (0, 1); // RAX, RDX
    } else if #[cfg(any(target_arch = "arm", target_arch = "aarch64"))] {
        pub const UNWIND_DATA_REG: (c_int, c_int) = (0, 1); // R0, R1 / X0, X1
    } else if #[cfg(any(target_arch = "mips", target_arch = "mips64"))] {
        pub const UNWIND_DATA_REG: (c_int, c_int) = (4, 5); // A0, A1
    } else if #[cfg(any(target_arch = "powerpc", target_arch = "powerpc64"))] {
        pub const UNWIND_DATA_REG: (c_int, c_int) = (3, 4); // R3, R4 / X3, X4
    } else if #[cfg(any(target_arch = "riscv64", target_arch = "riscv32"))] {
        pub const UNWIND_DATA_REG: (c_int, c_int) = (10, 11); // x10, x11
    } else if #[cfg(target_arch = "s390x")] {
        pub const UNWIND_DATA_REG: (c_int, c_int) = (6, 7); // R6, R7
    } else if #[cfg(target_arch = "loongarch64")] {
        pub const UNWIND_DATA_REG: (c_int, c_int) = (4, 5); // a0, a1
    }
}

pub type _Unwind_Exception_Cleanup_Fn =
    Option<unsafe extern "C" fn(unwind_code: _Unwind_Reason_Code, exception: *mut _Unwind_Exception)>;

/// Must be the first field of every language-level exception header: the
/// unwinder only ever sees a pointer to this struct.
#[repr(C)]
pub struct _Unwind_Exception {
    pub exception_class: _Unwind_Exception_Class,
    pub exception_cleanup: _Unwind_Exception_Cleanup_Fn,
    pub private: [_Unwind_Word; unwinder_private_data_size],
}

impl _Unwind_Exception {
    pub const fn new(exception_class: _Unwind_Exception_Class) -> Self {
        Self {
            exception_class,
            exception_cleanup: None,
            private: [0; unwinder_private_data_size],
        }
    }
}

pub enum _Unwind_Context {}

pub type _Unwind_Personality_Fn = unsafe extern "C" fn(
    version: c_int,
    actions: _Unwind_Action,
    exception_class: _Unwind_Exception_Class,
    exception_object: *mut _Unwind_Exception,
    context: *mut _Unwind_Context,
) -> _Unwind_Reason_Code;

cfg_if::cfg_if! {
    if #[cfg(any(feature = "llvm-libunwind", feature = "system-llvm-libunwind"))] {
        #[link(name = "unwind")]
        extern "C" {}
    } else if #[cfg(any(target_os = "linux", target_os = "fuchsia", target_os = "freebsd"))] {
        #[link(name = "gcc_s")]
        extern "C" {}
    }
}

extern "C" {
    pub fn _Unwind_RaiseException(exception: *mut _Unwind_Exception) -> _Unwind_Reason_Code;
    pub fn _Unwind_Resume(exception: *mut _Unwind_Exception) -> !;
    pub fn _Unwind_DeleteException(exception: *mut _Unwind_Exception);

    pub fn _Unwind_GetLanguageSpecificData(ctx: *mut _Unwind_Context) -> *mut c_void;
    pub fn _Unwind_GetRegionStart(ctx: *mut _Unwind_Context) -> _Unwind_Ptr;
    pub fn _Unwind_GetTextRelBase(ctx: *mut _Unwind_Context) -> _Unwind_Ptr;
    pub fn _Unwind_GetDataRelBase(ctx: *mut _Unwind_Context) -> _Unwind_Ptr;
    pub fn _Unwind_GetCFA(ctx: *mut _Unwind_Context) -> _Unwind_Word;
    pub fn _Unwind_GetIPInfo(ctx: *mut _Unwind_Context, ip_before_insn: *mut c_int) -> _Unwind_Word;

    pub fn _Unwind_SetGR(ctx: *mut _Unwind_Context, reg_index: c_int, value: _Unwind_Word);
    pub fn _Unwind_SetIP(ctx: *mut _Unwind_Context, value: _Unwind_Word);
}
