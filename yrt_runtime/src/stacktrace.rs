use std::ffi::c_void;
use std::fmt::Write;

use crate::config;
use crate::demangle::demangle;

/// Innermost frames that belong to the diagnostic machinery itself.
const SKIPPED_FRAMES: usize = 2;

/// Return addresses of the calling thread, innermost first. Empty unless
/// tracing is enabled.
pub fn capture_raw_trace() -> Vec<usize> {
    if !config::trace_enabled() {
        return Vec::new();
    }

    let max = config::max_trace_len();
    let mut trace = Vec::with_capacity(max);
    backtrace::trace(|frame| {
        if trace.len() >= max {
            return false;
        }
        trace.push(frame.ip() as usize);
        true
    });
    trace
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedFrame {
    pub function: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
}

fn resolve_address(address: usize) -> ResolvedFrame {
    let mut resolved = ResolvedFrame::default();
    backtrace::resolve(address as *mut c_void, |symbol| {
        if resolved.function.is_none() {
            resolved.function = symbol.name().map(|name| match name.as_str() {
                Some(raw) if raw.starts_with("_Y") => demangle(raw.as_bytes()).into_owned(),
                _ => name.to_string(),
            });
        }
        if resolved.file.is_none() {
            resolved.file = symbol.filename().map(|path| path.display().to_string());
            resolved.line = symbol.lineno();
        }
    });
    resolved
}

/// Renders resolved frames, numbered from 1. Empty input renders as an
/// empty string.
pub fn format_trace(frames: &[ResolvedFrame]) -> String {
    if frames.is_empty() {
        return String::new();
    }

    let mut out = String::from("╭  Stack trace :");
    for (i, frame) in frames.iter().enumerate() {
        let index = i + 1;
        // writing into a String cannot fail
        let _ = match &frame.file {
            Some(_) => write!(out, "\n╞═ bt ╕ #{}", index),
            None => write!(out, "\n╞═ bt ═ #{}", index),
        };
        if let Some(function) = &frame.function {
            let _ = write!(out, " in function \x1b[33m{}\x1b[0m", function);
        }
        if let Some(file) = &frame.file {
            let _ = match frame.line {
                Some(line) => write!(out, "\n│     ╘═> \x1b[32m{}\x1b[0m:{}", file, line),
                None => write!(out, "\n│     ╘═> \x1b[32m{}\x1b[0m:??", file),
            };
        }
    }
    out.push_str("\n╰");
    out
}

/// Symbolizes a trace from [`capture_raw_trace`], best effort.
pub fn resolve_trace(addresses: &[usize]) -> String {
    if !config::trace_enabled() || addresses.len() <= SKIPPED_FRAMES {
        return String::new();
    }

    let frames: Vec<ResolvedFrame> = addresses[SKIPPED_FRAMES..]
        .iter()
        .map(|address| resolve_address(*address))
        .collect();
    format_trace(&frames)
}

/// The current trace, ready to print; empty when tracing is off.
pub fn current_trace() -> String {
    resolve_trace(&capture_raw_trace())
}
