//! Processor identity.
//!
//! Per-CPU state throughout the kernel is kept in arrays indexed by the CPU
//! index returned here. Until the platform registers a resolver (normally
//! once the local APIC is up) every caller is treated as the bootstrap
//! processor, index 0.

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

pub use kestrel_abi::MAX_CPUS;

/// Returns the index of the executing CPU, `0..MAX_CPUS`.
pub type CpuIndexFn = fn() -> usize;

static CPU_INDEX_FN: AtomicPtr<()> = AtomicPtr::new(ptr::null_mut());

pub fn register_cpu_index_fn(f: CpuIndexFn) {
    CPU_INDEX_FN.store(f as *mut (), Ordering::Release);
}

#[inline]
pub fn get_current_cpu() -> usize {
    let fn_ptr = CPU_INDEX_FN.load(Ordering::Acquire);
    if fn_ptr.is_null() {
        return 0;
    }
    // SAFETY: only `register_cpu_index_fn` stores into CPU_INDEX_FN, and it
    // only stores valid `CpuIndexFn` pointers.
    let f: CpuIndexFn = unsafe { core::mem::transmute(fn_ptr) };
    f().min(MAX_CPUS - 1)
}
