//! System time on the legacy PIT, routed through the remapped 8259 pair.

use core::sync::atomic::{AtomicU64, Ordering};

use kestrel_abi::{IRQ_BASE_GATE, TIMER_GATE, TIMER_HZ};
use kestrel_core::intr::{self, TrapContext};
use kestrel_core::sched;
use kestrel_lib::{fatal, klog_info, klog_warn, ports};
use pic8259::ChainedPics;
use spin::Mutex;

const PIC_1_OFFSET: u8 = IRQ_BASE_GATE as u8;
const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

/// Everything masked except IRQ0 (timer) and IRQ2 (cascade).
const PIC_1_MASK_TIMER: u8 = !0b0000_0101;
const PIC_MASK_ALL: u8 = 0xFF;

const CALIBRATION_LIMIT: u64 = 1 << 32;

// SAFETY: the offsets put both PICs above the exception gates.
static PICS: Mutex<ChainedPics> = Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

static TICKS: AtomicU64 = AtomicU64::new(0);
static LOOPS_PER_TICK: AtomicU64 = AtomicU64::new(0);

/// Ticks since the timer started.
pub fn systime() -> u64 {
    TICKS.load(Ordering::Acquire)
}

/// Remap both PICs and mask every line.
pub fn pic_init() {
    let _irq = intr::guard();
    let mut pics = PICS.lock();
    // SAFETY: port I/O on the 8259 pair, delivery disabled.
    unsafe {
        pics.initialize();
        pics.write_masks(PIC_MASK_ALL, PIC_MASK_ALL);
    }
}

fn timer_tick(_ctx: &mut TrapContext) -> bool {
    TICKS.fetch_add(1, Ordering::AcqRel);
    // SAFETY: acknowledging the line we are servicing.
    unsafe { PICS.lock().notify_end_of_interrupt(TIMER_GATE as u8) };
    sched::request_reschedule();
    true
}

pub fn systime_init() {
    if let Err(err) = intr::add(TIMER_GATE, timer_tick) {
        fatal!("systime: {}", err);
    }

    let _irq = intr::guard();
    // SAFETY: PIT and PIC port I/O with delivery disabled.
    unsafe {
        ports::pit_program(TIMER_HZ);
        PICS.lock().write_masks(PIC_1_MASK_TIMER, PIC_MASK_ALL);
    }
    klog_info!("systime: PIT at {} Hz on gate {}", TIMER_HZ, TIMER_GATE);
}

pub fn systime_report() {
    klog_info!("systime: {} ticks since timer start", systime());
}

/// Count busy-loop iterations in one tick. Needs a running timer.
pub fn calibrate_delay() {
    let Some(edge) = wait_for_tick(systime()) else {
        klog_warn!("delay: timer not ticking, calibration skipped");
        return;
    };
    let mut loops = 0u64;
    while systime() == edge && loops < CALIBRATION_LIMIT {
        loops += 1;
        core::hint::spin_loop();
    }
    LOOPS_PER_TICK.store(loops, Ordering::Release);
    klog_info!("delay: {} loops per tick", loops_per_tick());
}

pub fn loops_per_tick() -> u64 {
    LOOPS_PER_TICK.load(Ordering::Acquire)
}

fn wait_for_tick(from: u64) -> Option<u64> {
    for _ in 0..CALIBRATION_LIMIT {
        let now = systime();
        if now != from {
            return Some(now);
        }
        core::hint::spin_loop();
    }
    None
}
