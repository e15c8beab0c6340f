//! Exception handling and stack unwinding for compiled Ymir programs.
//!
//! Generated code raises with `_yrt_exc_throw`, lands in a landing pad chosen
//! by the `__gyc_personality_v0` personality routine and retrieves the payload
//! with `_yrt_exc_begin_catch`. Anything that escapes ends in [`panic`].

pub mod config;
pub mod demangle;
pub mod eh;
pub mod error;
mod ffi;
pub mod panic;
pub mod stacktrace;
mod thread;

pub use config::{init, RuntimeOptions};
pub use error::EhError;
pub use thread::ThreadId;
