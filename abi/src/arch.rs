//! x86_64 gate numbering.
//!
//! Gates 0-31 are CPU exceptions, 32-47 carry the remapped legacy PIC lines,
//! everything above is free for devices and IPIs.

/// Interrupt gate identifier (IDT vector).
pub type Gate = u16;

pub const EXCEPTION_DIVIDE_ERROR: Gate = 0;
pub const EXCEPTION_DEBUG: Gate = 1;
pub const EXCEPTION_NMI: Gate = 2;
pub const EXCEPTION_BREAKPOINT: Gate = 3;
pub const EXCEPTION_OVERFLOW: Gate = 4;
pub const EXCEPTION_BOUND_RANGE: Gate = 5;
pub const EXCEPTION_INVALID_OPCODE: Gate = 6;
pub const EXCEPTION_DEVICE_NOT_AVAILABLE: Gate = 7;
pub const EXCEPTION_DOUBLE_FAULT: Gate = 8;
pub const EXCEPTION_INVALID_TSS: Gate = 10;
pub const EXCEPTION_SEGMENT_NOT_PRESENT: Gate = 11;
pub const EXCEPTION_STACK_FAULT: Gate = 12;
pub const EXCEPTION_GENERAL_PROTECTION: Gate = 13;
pub const EXCEPTION_PAGE_FAULT: Gate = 14;
pub const EXCEPTION_X87_FPU: Gate = 16;
pub const EXCEPTION_ALIGNMENT_CHECK: Gate = 17;
pub const EXCEPTION_MACHINE_CHECK: Gate = 18;
pub const EXCEPTION_SIMD_FPU: Gate = 19;

/// Number of architecturally reserved exception gates.
pub const EXCEPTION_GATES: Gate = 32;

/// Base gate for hardware IRQs (legacy IRQ0 maps here after PIC remap).
pub const IRQ_BASE_GATE: Gate = 32;

/// Gate of the legacy PIT timer line.
pub const TIMER_GATE: Gate = IRQ_BASE_GATE;

/// Gate used for spurious interrupts.
pub const SPURIOUS_GATE: Gate = 0xFF;

/// How an unhandled interrupt on a gate is treated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateClass {
    /// Unrecoverable CPU exception: unhandled means halt.
    Fault,
    /// Diagnostic exception (#DB, NMI, #BP): log and continue.
    Trap,
    /// Device, IPI or spurious vector: log once and continue.
    Device,
}

impl GateClass {
    pub const fn of(gate: Gate) -> Self {
        match gate {
            EXCEPTION_DEBUG | EXCEPTION_NMI | EXCEPTION_BREAKPOINT => Self::Trap,
            g if g < EXCEPTION_GATES => Self::Fault,
            _ => Self::Device,
        }
    }

    #[inline]
    pub const fn is_fatal_when_unhandled(self) -> bool {
        matches!(self, Self::Fault)
    }
}

/// Human readable exception name for diagnostics.
pub const fn exception_name(gate: Gate) -> &'static str {
    match gate {
        EXCEPTION_DIVIDE_ERROR => "divide error",
        EXCEPTION_DEBUG => "debug",
        EXCEPTION_NMI => "non-maskable interrupt",
        EXCEPTION_BREAKPOINT => "breakpoint",
        EXCEPTION_OVERFLOW => "overflow",
        EXCEPTION_BOUND_RANGE => "bound range exceeded",
        EXCEPTION_INVALID_OPCODE => "invalid opcode",
        EXCEPTION_DEVICE_NOT_AVAILABLE => "device not available",
        EXCEPTION_DOUBLE_FAULT => "double fault",
        EXCEPTION_INVALID_TSS => "invalid TSS",
        EXCEPTION_SEGMENT_NOT_PRESENT => "segment not present",
        EXCEPTION_STACK_FAULT => "stack-segment fault",
        EXCEPTION_GENERAL_PROTECTION => "general protection fault",
        EXCEPTION_PAGE_FAULT => "page fault",
        EXCEPTION_X87_FPU => "x87 floating point",
        EXCEPTION_ALIGNMENT_CHECK => "alignment check",
        EXCEPTION_MACHINE_CHECK => "machine check",
        EXCEPTION_SIMD_FPU => "SIMD floating point",
        g if g < EXCEPTION_GATES => "reserved exception",
        _ => "interrupt",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_classes() {
        assert_eq!(GateClass::of(EXCEPTION_PAGE_FAULT), GateClass::Fault);
        assert_eq!(GateClass::of(EXCEPTION_DOUBLE_FAULT), GateClass::Fault);
        assert_eq!(GateClass::of(EXCEPTION_BREAKPOINT), GateClass::Trap);
        assert_eq!(GateClass::of(EXCEPTION_NMI), GateClass::Trap);
        assert_eq!(GateClass::of(31), GateClass::Fault);
        assert_eq!(GateClass::of(TIMER_GATE), GateClass::Device);
        assert_eq!(GateClass::of(SPURIOUS_GATE), GateClass::Device);
        assert!(GateClass::Fault.is_fatal_when_unhandled());
        assert!(!GateClass::Device.is_fatal_when_unhandled());
    }
}
