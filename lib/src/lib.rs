#![no_std]

#[cfg(test)]
extern crate std;

pub mod cpu;
pub mod init_flag;
pub mod klog;
pub mod pcr;
pub mod ports;
pub mod service_macro;
pub mod switch;

#[doc(hidden)]
pub use paste;
#[doc(hidden)]
pub use spin;

pub use init_flag::InitFlag;
pub use klog::{KlogLevel, klog_get_level, klog_init, klog_register_backend, klog_set_level};
pub use pcr::{MAX_CPUS, get_current_cpu, register_cpu_index_fn};
pub use switch::SwitchContext;
