//! Kernel bring-up: the boot orchestrator, its collaborator table, the
//! Limine boot protocol glue and trap entry.

#![no_std]
#![cfg_attr(
    all(target_arch = "x86_64", target_os = "none"),
    feature(abi_x86_interrupt)
)]

#[cfg(test)]
extern crate std;

pub mod boot_seq;
pub mod boot_services;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod idt;
pub mod limine_protocol;
pub mod shutdown;

pub use boot_seq::{BootStage, boot, boot_stage, bootstrap_thread, is_kernel_initialized};
pub use boot_services::{BootServices, boot_services_registered, register_boot_services};
pub use limine_protocol::{BootInfo, boot_info, cmdline_value, ensure_base_revision};
pub use shutdown::{kernel_halt, kernel_quiesce_interrupts, panic_halt};
