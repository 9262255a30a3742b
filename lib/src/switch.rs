//! Low-level context switching.
//!
//! `SwitchContext` holds the callee-saved register state of a suspended
//! kernel context. The switch primitives are bare-metal only; hosted builds
//! run threads through the scheduler's `ContextSwitch` seam instead.

/// Initial RFLAGS for a fresh context: IF clear. A thread starts inside the
/// disable scope its scheduler held while switching, and releases it itself.
pub const INITIAL_RFLAGS: u64 = 0x002;

/// Callee-saved register state for a software context switch.
/// Layout must match the offsets used by `switch_registers`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SwitchContext {
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub rflags: u64,
}

const _: () = assert!(core::mem::size_of::<SwitchContext>() == 64);

impl SwitchContext {
    pub const fn zero() -> Self {
        Self {
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rbp: 0,
            rsp: 0,
            rflags: INITIAL_RFLAGS,
        }
    }

    /// Context that "returns" into `entry` on a fresh stack.
    ///
    /// `stack_top` must be 16-byte aligned; the return slot is placed so the
    /// entry function sees a SysV-conforming stack.
    pub const fn new_for_entry(stack_top: u64) -> Self {
        Self {
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rbp: 0,
            rsp: entry_slot(stack_top),
            rflags: INITIAL_RFLAGS,
        }
    }
}

/// Address of the return slot written by [`seed_stack`].
#[inline]
pub const fn entry_slot(stack_top: u64) -> u64 {
    (stack_top & !0xF) - 16
}

/// Write `entry` into the return slot of a fresh stack.
///
/// # Safety
///
/// `stack_top` must be the exclusive top of a writable stack of at least
/// 16 bytes that no running context uses.
pub unsafe fn seed_stack(stack_top: u64, entry: extern "C" fn() -> !) {
    let slot = entry_slot(stack_top) as *mut u64;
    unsafe { slot.write(entry as usize as u64) };
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod imp {
    use core::arch::naked_asm;
    use core::mem::offset_of;

    use super::SwitchContext;

    /// Saves callee-saved registers to `prev` and loads them from `next`.
    ///
    /// # Safety
    ///
    /// - Both contexts must be valid; `next` was produced by a previous
    ///   switch or by `SwitchContext::new_for_entry` + `seed_stack`
    /// - Must be called with interrupts disabled
    #[unsafe(naked)]
    pub unsafe extern "sysv64" fn switch_registers(
        prev: *mut SwitchContext,
        next: *const SwitchContext,
    ) {
        naked_asm!(
            "mov [rdi + {off_rbx}], rbx",
            "mov [rdi + {off_r12}], r12",
            "mov [rdi + {off_r13}], r13",
            "mov [rdi + {off_r14}], r14",
            "mov [rdi + {off_r15}], r15",
            "mov [rdi + {off_rbp}], rbp",
            "mov [rdi + {off_rsp}], rsp",
            "pushfq",
            "pop QWORD PTR [rdi + {off_rflags}]",

            "mov rbx, [rsi + {off_rbx}]",
            "mov r12, [rsi + {off_r12}]",
            "mov r13, [rsi + {off_r13}]",
            "mov r14, [rsi + {off_r14}]",
            "mov r15, [rsi + {off_r15}]",
            "mov rbp, [rsi + {off_rbp}]",
            "push QWORD PTR [rsi + {off_rflags}]",
            "popfq",
            "mov rsp, [rsi + {off_rsp}]",
            "ret",

            off_rbx = const offset_of!(SwitchContext, rbx),
            off_r12 = const offset_of!(SwitchContext, r12),
            off_r13 = const offset_of!(SwitchContext, r13),
            off_r14 = const offset_of!(SwitchContext, r14),
            off_r15 = const offset_of!(SwitchContext, r15),
            off_rbp = const offset_of!(SwitchContext, rbp),
            off_rsp = const offset_of!(SwitchContext, rsp),
            off_rflags = const offset_of!(SwitchContext, rflags),
        );
    }

    /// Abandon the current stack: move to `stack_top` and call `cont`.
    ///
    /// # Safety
    ///
    /// `stack_top` must be the 16-byte aligned top of a stack nothing else
    /// uses. Everything on the old stack is leaked.
    #[unsafe(naked)]
    pub unsafe extern "sysv64" fn switch_stack_and_call(
        stack_top: u64,
        cont: extern "C" fn() -> !,
    ) -> ! {
        naked_asm!(
            "mov rsp, rdi",
            "and rsp, -16",
            "xor ebp, ebp",
            "call rsi",
            "ud2",
        );
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use imp::{switch_registers, switch_stack_and_call};
