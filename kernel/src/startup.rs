//! Threads queued before the scheduler starts.

use kestrel_abi::TIMER_HZ;
use kestrel_core::sched;
use kestrel_core::task::{self, ThreadEntry};
use kestrel_lib::klog_info;

use crate::systime::systime;

static STARTUP_THREADS: [ThreadEntry; 3] = [heartbeat_fast, heartbeat_medium, heartbeat_slow];

pub fn startup_threads() -> &'static [ThreadEntry] {
    &STARTUP_THREADS
}

fn heartbeat_fast() {
    heartbeat(1)
}

fn heartbeat_medium() {
    heartbeat(2)
}

fn heartbeat_slow() {
    heartbeat(5)
}

/// Log every `seconds`, yielding in between.
fn heartbeat(seconds: u64) -> ! {
    let period = seconds * TIMER_HZ as u64;
    let mut next = systime() + period;
    loop {
        let now = systime();
        if now >= next {
            let stats = sched::sched_stats();
            klog_info!(
                "heartbeat: {:?} at tick {} ({} switches, {} yields)",
                task::thr_current(),
                now,
                stats.switches,
                stats.yields
            );
            next = now + period;
        }
        sched::yield_now();
    }
}
