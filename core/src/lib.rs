//! Kestrel control core.
//!
//! Interrupt enable/disable nesting and gate dispatch (`intr`), the ordered
//! boot extension registry (`extp`), the process/thread model (`task`) and
//! the handoff into the scheduler (`sched`).

#![no_std]

#[cfg(test)]
extern crate std;

pub mod extp;
pub mod intr;
pub mod sched;
pub mod task;

#[cfg(test)]
mod test_log;

pub use extp::{Extension, ExtensionRegistry, ExtpError, Phase, RegistryBuilder};
pub use intr::{Dispatch, IntrError, IntrHandler, InterruptController, IrqBackend, TrapContext};
pub use sched::{ContextSwitch, RunOutcome, SchedError, SchedStop, Scheduler};
pub use task::{Process, TaskError, TaskTable, Tasks, Thread, ThreadEntry};
