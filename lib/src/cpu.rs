//! Interrupt flag management and CPU halt.
//!
//! On bare metal these drive RFLAGS.IF directly. Hosted builds (unit tests,
//! tooling) have no interrupt flag to touch, so a per-process software flag
//! stands in for it and `halt` spins.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod imp {
    use x86_64::instructions::{hlt, interrupts};

    #[inline(always)]
    pub fn enable_interrupts() {
        interrupts::enable();
    }

    #[inline(always)]
    pub fn disable_interrupts() {
        interrupts::disable();
    }

    #[inline(always)]
    pub fn are_interrupts_enabled() -> bool {
        interrupts::are_enabled()
    }

    /// `sti; hlt`: the interrupt shadow of `sti` keeps a pending interrupt
    /// from slipping in before the halt.
    #[inline(always)]
    pub fn enable_and_halt() {
        interrupts::enable_and_hlt();
    }

    #[inline(always)]
    pub fn halt() {
        hlt();
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod imp {
    use core::sync::atomic::{AtomicBool, Ordering};

    static HOSTED_IF: AtomicBool = AtomicBool::new(false);

    #[inline(always)]
    pub fn enable_interrupts() {
        HOSTED_IF.store(true, Ordering::SeqCst);
    }

    #[inline(always)]
    pub fn disable_interrupts() {
        HOSTED_IF.store(false, Ordering::SeqCst);
    }

    #[inline(always)]
    pub fn are_interrupts_enabled() -> bool {
        HOSTED_IF.load(Ordering::SeqCst)
    }

    #[inline(always)]
    pub fn enable_and_halt() {
        enable_interrupts();
        core::hint::spin_loop();
    }

    #[inline(always)]
    pub fn halt() {
        core::hint::spin_loop();
    }
}

pub use imp::*;

/// Stop this CPU for good: delivery off, then halt in a loop.
pub fn halt_forever() -> ! {
    disable_interrupts();
    loop {
        halt();
    }
}
