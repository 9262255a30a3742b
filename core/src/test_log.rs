//! Captures klog output of the calling test thread.

use core::cell::RefCell;
use core::fmt;
use std::string::{String, ToString};
use std::vec::Vec;

std::thread_local! {
    static LINES: RefCell<Option<Vec<String>>> = const { RefCell::new(None) };
}

fn capture_backend(args: fmt::Arguments<'_>) {
    let line = args.to_string();
    LINES.with(|lines| {
        if let Some(lines) = lines.borrow_mut().as_mut() {
            lines.push(line);
        }
    });
}

/// Run `f` and return what it logged on this thread.
pub fn capture<R>(f: impl FnOnce() -> R) -> (R, Vec<String>) {
    kestrel_lib::klog_register_backend(capture_backend);
    LINES.with(|lines| *lines.borrow_mut() = Some(Vec::new()));
    let result = f();
    let lines = LINES.with(|lines| lines.borrow_mut().take()).unwrap_or_default();
    (result, lines)
}

/// Number of captured lines containing `needle`.
pub fn count(lines: &[String], needle: &str) -> usize {
    lines.iter().filter(|line| line.contains(needle)).count()
}
