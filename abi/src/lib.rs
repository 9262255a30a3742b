//! Kestrel shared kernel types.
//!
//! Plain data shared by every kernel layer: gate numbering, the thread
//! lifecycle state machine, process priority/ring classes, and the fixed
//! capacities of the kernel's static tables.

#![no_std]
#![forbid(unsafe_code)]

#[cfg(test)]
extern crate std;

pub mod arch;
pub mod limits;
pub mod task;

pub use arch::*;
pub use limits::*;
pub use task::*;
