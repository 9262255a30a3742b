//! Trap entry.
//!
//! Every vector funnels into one handler that snapshots the interrupt frame
//! into a [`TrapContext`] and dispatches it through the interrupt
//! controller. Device vectors are preemption points on the way out.

use kestrel_abi::{Gate, IRQ_BASE_GATE};
use kestrel_core::intr::{self, TrapContext};
use kestrel_core::sched;
use kestrel_lib::klog_debug;
use spin::Once;
use x86_64::set_general_handler;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame};

static IDT: Once<InterruptDescriptorTable> = Once::new();

fn trap_entry(frame: InterruptStackFrame, index: u8, error_code: Option<u64>) {
    let mut ctx = TrapContext {
        gate: index as Gate,
        error_code,
        rip: frame.instruction_pointer.as_u64(),
        cs: frame.code_segment.0 as u64,
        rflags: frame.cpu_flags.bits(),
        rsp: frame.stack_pointer.as_u64(),
        ss: frame.stack_segment.0 as u64,
    };
    intr::dispatch(&mut ctx);

    if ctx.gate >= IRQ_BASE_GATE {
        sched::preempt_from_trap();
    }
}

/// Build the IDT and load it on the calling CPU.
pub fn idt_init() {
    let idt = IDT.call_once(|| {
        let mut idt = InterruptDescriptorTable::new();
        set_general_handler!(&mut idt, trap_entry);
        idt
    });
    idt.load();
    klog_debug!("idt: loaded, all gates routed to dispatch");
}
