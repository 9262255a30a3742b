//! Boot orchestrator.
//!
//! One linear, non-restartable procedure takes the kernel from the loader's
//! hand-off to the scheduler:
//!
//! 1. logging
//! 2. early-kernel-init extensions (no allocation yet)
//! 3. physical memory
//! 4. CPU-init extensions
//! 5. core process from the active address space
//! 6. bootstrap thread, switched to directly
//! 7. platform-init extensions
//! 8. system timer
//! 9. timer-init and timer-dependent extensions
//! 10. startup threads queued
//! 11. bootstrap thread exited, scheduler started
//! 12. anything after that is fatal
//!
//! Steps 1-6 run on the loader's stack in [`boot`]; the rest runs on the
//! bootstrap thread in [`boot_continue`].
//!
//! Every CPU starts with one interrupt disable scope open. The orchestrator
//! keeps it through platform-init and releases it right before the system
//! timer starts.

use core::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use kestrel_abi::{Priority, Ring, ThreadId, ThreadState};
use kestrel_core::extp::{self, Phase};
use kestrel_core::{intr, sched, task};
use kestrel_lib::{InitFlag, fatal, klog_debug, klog_info};

use crate::boot_services::{
    BootServices, current_space, pmem_init, register_boot_services, startup_threads, systime_init,
};

/// Last completed orchestrator step.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum BootStage {
    NotStarted = 0,
    Logging = 1,
    EarlyKernelInit = 2,
    PhysicalMemory = 3,
    CpuInit = 4,
    CoreProcess = 5,
    BootstrapThread = 6,
    PlatformInit = 7,
    SystemTimer = 8,
    TimerPhases = 9,
    StartupThreads = 10,
    SchedulerStarted = 11,
}

impl BootStage {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Logging,
            2 => Self::EarlyKernelInit,
            3 => Self::PhysicalMemory,
            4 => Self::CpuInit,
            5 => Self::CoreProcess,
            6 => Self::BootstrapThread,
            7 => Self::PlatformInit,
            8 => Self::SystemTimer,
            9 => Self::TimerPhases,
            10 => Self::StartupThreads,
            11 => Self::SchedulerStarted,
            _ => Self::NotStarted,
        }
    }
}

static BOOT_ENTERED: InitFlag = InitFlag::new();
static KERNEL_INITIALIZED: InitFlag = InitFlag::new();
static STAGE: AtomicU8 = AtomicU8::new(BootStage::NotStarted as u8);
static BOOTSTRAP_THREAD: AtomicU32 = AtomicU32::new(ThreadId::NONE_RAW);

pub fn boot_stage() -> BootStage {
    BootStage::from_raw(STAGE.load(Ordering::Acquire))
}

/// True once control has been handed to the scheduler.
pub fn is_kernel_initialized() -> bool {
    KERNEL_INITIALIZED.is_set()
}

pub fn bootstrap_thread() -> Option<ThreadId> {
    ThreadId::from_raw(BOOTSTRAP_THREAD.load(Ordering::Acquire))
}

fn complete(stage: BootStage) {
    STAGE.store(stage as u8, Ordering::Release);
    klog_debug!("[boot] step {} done: {:?}", stage as u8, stage);
}

fn run_phase(phase: Phase) {
    if let Err(err) = extp::run_phase(phase) {
        fatal!("boot: cannot run phase {}: {}", phase, err);
    }
}

/// Bring the kernel up. Never returns; entering it twice is fatal.
pub fn boot(services: &'static BootServices) -> ! {
    if !BOOT_ENTERED.init_once() {
        fatal!("boot: entered twice");
    }
    register_boot_services(services);

    kestrel_lib::klog_init();
    complete(BootStage::Logging);

    run_phase(Phase::EarlyKernelInit);
    klog_info!("kestrel {} booting", env!("CARGO_PKG_VERSION"));
    complete(BootStage::EarlyKernelInit);

    pmem_init();
    complete(BootStage::PhysicalMemory);

    run_phase(Phase::CpuInit);
    complete(BootStage::CpuInit);

    let space = current_space();
    let core = match task::prc_new(space, Priority::Normal, Ring::Kernel) {
        Ok(pid) => pid,
        Err(err) => fatal!("boot: cannot create core process: {}", err),
    };
    if let Err(err) = task::set_core_process(core) {
        fatal!("boot: {}", err);
    }
    klog_info!("boot: core process {} on space {:#x}", core, space.root());
    complete(BootStage::CoreProcess);

    let bootstrap = match task::thr_create(core, None) {
        Ok(tid) => tid,
        Err(err) => fatal!("boot: cannot create bootstrap thread: {}", err),
    };
    if let Err(err) = task::tasks().with(|t| t.force_state(bootstrap, ThreadState::Runnable)) {
        fatal!("boot: {}", err);
    }
    BOOTSTRAP_THREAD.store(bootstrap.0, Ordering::Release);
    complete(BootStage::BootstrapThread);

    sched::bootstrap_transfer(task::tasks(), bootstrap, boot_continue)
}

/// Steps 7-12, on the bootstrap thread.
fn boot_continue() -> ! {
    run_phase(Phase::PlatformInit);
    complete(BootStage::PlatformInit);

    intr::enable();
    systime_init();
    complete(BootStage::SystemTimer);

    run_phase(Phase::TimerInit);
    run_phase(Phase::TimerDependent);
    complete(BootStage::TimerPhases);

    let Some(core) = task::core_process() else {
        fatal!("boot: core process missing");
    };
    for &entry in startup_threads() {
        let tid = match task::thr_create(core, Some(entry)) {
            Ok(tid) => tid,
            Err(err) => fatal!("boot: cannot create startup thread: {}", err),
        };
        if let Err(err) = sched::sched_add(tid) {
            fatal!("boot: cannot queue {}: {}", tid, err);
        }
    }
    complete(BootStage::StartupThreads);

    let Some(bootstrap) = bootstrap_thread() else {
        fatal!("boot: bootstrap thread missing");
    };
    if let Err(err) = task::thr_set_state(bootstrap, ThreadState::Exited) {
        fatal!("boot: {}", err);
    }
    KERNEL_INITIALIZED.mark_set();
    complete(BootStage::SchedulerStarted);
    klog_info!("boot: entering scheduler");

    let stop = sched::sched_start();
    fatal!("kernel ended unexpectedly: scheduler returned ({})", stop)
}

#[cfg(test)]
mod tests {
    use std::string::String;
    use std::sync::Mutex;
    use std::vec::Vec;

    use kestrel_abi::SpaceHandle;
    use kestrel_core::extp::RegistryBuilder;
    use kestrel_core::task::ThreadEntry;

    use super::*;

    static TRACE: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());

    fn trace(step: &'static str) {
        TRACE.lock().unwrap().push(step);
    }

    fn mem() {
        trace("mem");
    }
    fn mem2() {
        // Physical memory must not be up yet.
        assert!(!TRACE.lock().unwrap().contains(&"pmem"));
        trace("mem2");
    }
    fn cpu() {
        trace("cpu");
    }
    fn platform() {
        // The boot disable scope is still open.
        assert_eq!(intr::depth(), 1);
        assert_eq!(task::thr_current(), bootstrap_thread());
        trace("platform");
    }
    fn timer() {
        trace("timer");
    }
    fn timer_dependent() {
        trace("timer-dep");
    }
    fn worker() {
        assert!(is_kernel_initialized());
        trace("worker");
    }

    static STARTUP: [ThreadEntry; 1] = [worker];

    fn fake_pmem_init() {
        trace("pmem");
    }
    fn fake_current_space() -> SpaceHandle {
        trace("space");
        SpaceHandle(0xdead_0000)
    }
    fn fake_systime_init() {
        assert_eq!(intr::depth(), 0);
        trace("systime");
    }
    fn fake_startup_threads() -> &'static [ThreadEntry] {
        &STARTUP
    }

    static SERVICES: BootServices = BootServices {
        pmem_init: fake_pmem_init,
        current_space: fake_current_space,
        systime_init: fake_systime_init,
        startup_threads: fake_startup_threads,
    };

    #[test]
    fn test_boot_runs_steps_in_order_and_ends_fatally() {
        let mut builder = RegistryBuilder::new();
        builder
            .register(Phase::TimerInit, "timer", timer, "system timer consumers")
            .unwrap()
            .register(Phase::EarlyKernelInit, "mem", mem, "x")
            .unwrap()
            .register(Phase::PlatformInit, "platform", platform, "platform devices")
            .unwrap()
            .register(Phase::EarlyKernelInit, "mem2", mem2, "y")
            .unwrap()
            .register(Phase::TimerDependent, "timer-dep", timer_dependent, "tick users")
            .unwrap()
            .register(Phase::CpuInit, "cpu", cpu, "cpu context")
            .unwrap();
        extp::install(builder.build()).unwrap();
        assert_eq!(boot_stage(), BootStage::NotStarted);

        let result = std::panic::catch_unwind(|| {
            boot(&SERVICES);
        });
        let payload = result.expect_err("boot returned");
        let message = payload
            .downcast_ref::<String>()
            .cloned()
            .unwrap_or_default();
        assert!(
            message.contains("kernel ended unexpectedly"),
            "unexpected fatal: {message}"
        );

        assert_eq!(
            *TRACE.lock().unwrap(),
            [
                "mem", "mem2", "pmem", "cpu", "space", "platform", "systime", "timer",
                "timer-dep", "worker",
            ]
        );
        assert_eq!(boot_stage(), BootStage::SchedulerStarted);
        assert!(is_kernel_initialized());

        let core = task::core_process().unwrap();
        let process = task::tasks().with(|t| t.process(core).copied()).unwrap();
        assert_eq!(process.space, SpaceHandle(0xdead_0000));
        assert_eq!(process.ring, Ring::Kernel);

        // The bootstrap thread is exited and was never scheduled; the worker
        // ran and was reaped.
        let bootstrap = bootstrap_thread().unwrap();
        assert_eq!(task::thr_state(bootstrap), Some(ThreadState::Exited));
        assert_eq!(task::prc_threads(core).unwrap().as_slice(), &[bootstrap]);
        assert_eq!(sched::sched_stats().switches, 1);
        assert_eq!(intr::depth(), 0);

        // Not restartable.
        let again = std::panic::catch_unwind(|| {
            boot(&SERVICES);
        });
        assert!(again.is_err());
    }

    #[test]
    fn test_stage_order() {
        assert!(BootStage::CpuInit < BootStage::CoreProcess);
        assert_eq!(BootStage::from_raw(6), BootStage::BootstrapThread);
        assert_eq!(BootStage::from_raw(42), BootStage::NotStarted);
    }
}
