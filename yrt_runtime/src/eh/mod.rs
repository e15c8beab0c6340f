//! Zero-cost exceptions on top of the platform unwinder.

pub mod header;
pub mod lsda;
pub mod personality;
pub mod protocol;
pub mod registry;

pub use header::{ExceptionHeader, ExceptionObject, HandlerRecord, YRT_EXCEPTION_CLASS};
pub use personality::{FrameContext, UnwindFrame};
pub use registry::{Registry, ThreadExceptionStack};
