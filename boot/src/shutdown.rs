use core::panic::PanicInfo;

use kestrel_lib::{InitFlag, cpu, klog_error, klog_info};

static HALT_IN_PROGRESS: InitFlag = InitFlag::new();
static PANIC_IN_PROGRESS: InitFlag = InitFlag::new();

/// Turn delivery off on this CPU, bypassing the nesting counter.
pub fn kernel_quiesce_interrupts() {
    cpu::disable_interrupts();
}

/// Stop the kernel for good.
pub fn kernel_halt(reason: &str) -> ! {
    kernel_quiesce_interrupts();
    if HALT_IN_PROGRESS.init_once() {
        klog_info!("Kernel halted: {}", reason);
    }
    cpu::halt_forever()
}

/// Panic handler body: report once, then halt with delivery off.
pub fn panic_halt(info: &PanicInfo<'_>) -> ! {
    kernel_quiesce_interrupts();
    if !PANIC_IN_PROGRESS.init_once() {
        cpu::halt_forever();
    }
    match info.location() {
        Some(loc) => klog_error!(
            "PANIC at {}:{}: {}",
            loc.file(),
            loc.line(),
            info.message()
        ),
        None => klog_error!("PANIC: {}", info.message()),
    }
    kernel_halt("panic")
}
