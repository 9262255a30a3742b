//! Scheduler handoff.
//!
//! `sched_add` queues runnable threads, `sched_start` takes over the CPU
//! and runs them in FIFO order until the ready set is permanently empty.
//! `bootstrap_transfer` is the one-shot jump from the linear boot path into
//! the bootstrap thread; it is deliberately not part of the regular
//! switching path and never returns.
//!
//! Running a thread goes through the [`ContextSwitch`] seam. On bare metal
//! [`ArchSwitch`] gives every thread its own stack and switches registers;
//! hosted builds use [`DirectSwitch`], which runs an entry to completion.
//!
//! Every register switch happens at interrupt nesting depth exactly one on
//! both sides: the scheduler holds a disable scope while it switches into a
//! thread, and a thread opens one (or is inside a trap scope) while it
//! switches back. Whichever side resumes closes the scope. A thread that
//! tries to yield with a scope of its own still open is refused.

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use kestrel_abi::{MAX_CPUS, MAX_THREADS, ThreadId, ThreadState};
use kestrel_lib::{fatal, klog_debug, klog_error, klog_info, klog_warn, pcr};
use spin::Mutex;

use crate::intr;
use crate::task::{self, Tasks, Thread};

/// Why a thread handed the CPU back to the scheduler.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Yielded = 1,
    Blocked = 2,
    Exited = 3,
}

impl RunOutcome {
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Yielded),
            2 => Some(Self::Blocked),
            3 => Some(Self::Exited),
            _ => None,
        }
    }
}

/// Why `start` returned. Both are fatal for the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedStop {
    /// No runnable or blocked thread is left.
    ReadySetEmpty,
    /// `start` was already called on this scheduler.
    AlreadyStarted,
}

impl fmt::Display for SchedStop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedStop::ReadySetEmpty => f.write_str("ready set permanently empty"),
            SchedStop::AlreadyStarted => f.write_str("scheduler already started"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedError {
    NoSuchThread(ThreadId),
    NotRunnable(ThreadId, ThreadState),
    AlreadyQueued(ThreadId),
    QueueFull,
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::NoSuchThread(tid) => write!(f, "no such thread: {}", tid),
            SchedError::NotRunnable(tid, state) => write!(f, "{} is {}, not runnable", tid, state),
            SchedError::AlreadyQueued(tid) => write!(f, "{} is already queued", tid),
            SchedError::QueueFull => f.write_str("ready queue full"),
        }
    }
}

/// Runs one thread on the current CPU.
pub trait ContextSwitch {
    /// Run `thread` until it yields, blocks or exits. The thread is already
    /// marked `Running` and current on this CPU.
    fn run(&self, thread: &Thread) -> RunOutcome;

    /// Wait for an event while every remaining thread is blocked.
    /// `has_work` reports whether the ready set filled up in the meantime.
    fn idle(&self, has_work: &dyn Fn() -> bool);
}

struct ReadyQueue {
    ids: [ThreadId; MAX_THREADS],
    head: usize,
    len: usize,
}

impl ReadyQueue {
    const fn new() -> Self {
        Self {
            ids: [ThreadId(ThreadId::NONE_RAW); MAX_THREADS],
            head: 0,
            len: 0,
        }
    }

    fn contains(&self, tid: ThreadId) -> bool {
        (0..self.len).any(|i| self.ids[(self.head + i) % MAX_THREADS] == tid)
    }

    fn push(&mut self, tid: ThreadId) -> Result<(), SchedError> {
        if self.len >= MAX_THREADS {
            return Err(SchedError::QueueFull);
        }
        if self.contains(tid) {
            return Err(SchedError::AlreadyQueued(tid));
        }
        self.ids[(self.head + self.len) % MAX_THREADS] = tid;
        self.len += 1;
        Ok(())
    }

    fn pop(&mut self) -> Option<ThreadId> {
        if self.len == 0 {
            return None;
        }
        let tid = self.ids[self.head];
        self.head = (self.head + 1) % MAX_THREADS;
        self.len -= 1;
        Some(tid)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedStats {
    pub switches: u64,
    pub yields: u64,
    pub ready: usize,
}

pub struct Scheduler {
    ready: Mutex<ReadyQueue>,
    started: AtomicBool,
    switches: AtomicU64,
    yields: AtomicU64,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            ready: Mutex::new(ReadyQueue::new()),
            started: AtomicBool::new(false),
            switches: AtomicU64::new(0),
            yields: AtomicU64::new(0),
        }
    }

    fn with_ready<R>(&self, f: impl FnOnce(&mut ReadyQueue) -> R) -> R {
        let _irq = intr::guard();
        let mut ready = self.ready.lock();
        f(&mut ready)
    }

    /// Queue a `Runnable` thread. Allowed before `start`.
    pub fn add(&self, tasks: &Tasks, tid: ThreadId) -> Result<(), SchedError> {
        let state = tasks
            .with(|t| t.state(tid))
            .ok_or(SchedError::NoSuchThread(tid))?;
        if state != ThreadState::Runnable {
            return Err(SchedError::NotRunnable(tid, state));
        }
        self.with_ready(|q| q.push(tid))?;
        klog_debug!("sched: {} queued", tid);
        Ok(())
    }

    /// Make a blocked thread runnable again and queue it.
    pub fn wake(&self, tasks: &Tasks, tid: ThreadId) -> Result<(), SchedError> {
        tasks
            .with(|t| match t.state(tid) {
                Some(ThreadState::Blocked) => t
                    .set_state(tid, ThreadState::Runnable)
                    .map(|_| ())
                    .map_err(|_| SchedError::NoSuchThread(tid)),
                Some(state) => Err(SchedError::NotRunnable(tid, state)),
                None => Err(SchedError::NoSuchThread(tid)),
            })?;
        self.with_ready(|q| q.push(tid))
    }

    pub fn stats(&self) -> SchedStats {
        SchedStats {
            switches: self.switches.load(Ordering::Relaxed),
            yields: self.yields.load(Ordering::Relaxed),
            ready: self.with_ready(|q| q.len),
        }
    }

    /// Take over the calling CPU. Only returns once nothing is left to run.
    pub fn start(&self, tasks: &Tasks, cs: &impl ContextSwitch) -> SchedStop {
        if self.started.swap(true, Ordering::AcqRel) {
            return SchedStop::AlreadyStarted;
        }
        klog_info!("sched: started on cpu {}", pcr::get_current_cpu());

        let home = tasks.current();
        loop {
            let Some(thread) = self.pick(tasks) else {
                if tasks.with(|t| t.count_in(ThreadState::Blocked)) == 0 {
                    return SchedStop::ReadySetEmpty;
                }
                cs.idle(&|| self.with_ready(|q| q.len) > 0);
                continue;
            };

            tasks.set_current(Some(thread.id));
            self.switches.fetch_add(1, Ordering::Relaxed);
            let outcome = cs.run(&thread);
            tasks.set_current(home);

            self.settle(tasks, thread.id, outcome);
        }
    }

    /// Pop the next queued thread that is still runnable and mark it running.
    /// Entries whose thread left `Runnable` while queued are dropped.
    fn pick(&self, tasks: &Tasks) -> Option<Thread> {
        while let Some(tid) = self.with_ready(ReadyQueue::pop) {
            let picked = tasks.with(|t| {
                t.set_state(tid, ThreadState::Running).ok()?;
                t.thread(tid).copied()
            });
            match picked {
                Some(thread) => return Some(thread),
                None => klog_debug!("sched: skipping stale entry {}", tid),
            }
        }
        None
    }

    fn settle(&self, tasks: &Tasks, tid: ThreadId, outcome: RunOutcome) {
        let settled = tasks.with(|t| -> Result<bool, task::TaskError> {
            match outcome {
                RunOutcome::Yielded => t.set_state(tid, ThreadState::Runnable).map(|_| true),
                RunOutcome::Blocked => t.set_state(tid, ThreadState::Blocked).map(|_| false),
                RunOutcome::Exited => {
                    t.set_state(tid, ThreadState::Exited)?;
                    t.reap(tid);
                    Ok(false)
                }
            }
        });

        match settled {
            Ok(true) => {
                self.yields.fetch_add(1, Ordering::Relaxed);
                if let Err(err) = self.with_ready(|q| q.push(tid)) {
                    klog_warn!("sched: requeue of {} failed: {}", tid, err);
                }
            }
            Ok(false) => {}
            Err(err) => klog_warn!("sched: {} after {:?}: {}", tid, outcome, err),
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

// -- Hosted runner ------------------------------------------------------------

/// Runs a thread's entry to completion on the caller's stack.
pub struct DirectSwitch;

impl ContextSwitch for DirectSwitch {
    fn run(&self, thread: &Thread) -> RunOutcome {
        if let Some(entry) = thread.entry {
            entry();
        }
        RunOutcome::Exited
    }

    fn idle(&self, _has_work: &dyn Fn() -> bool) {
        core::hint::spin_loop();
    }
}

// -- Reschedule requests ------------------------------------------------------

static RESCHEDULE: [AtomicBool; MAX_CPUS] = [const { AtomicBool::new(false) }; MAX_CPUS];

/// Ask the current CPU to switch threads at the next preemption point.
pub fn request_reschedule() {
    RESCHEDULE[pcr::get_current_cpu()].store(true, Ordering::Release);
}

fn take_reschedule() -> bool {
    RESCHEDULE[pcr::get_current_cpu()].swap(false, Ordering::AcqRel)
}

/// Whether a thread at interrupt nesting `depth` may hand the CPU back.
/// Switching with a scope of its own open would leave the next thread
/// running with delivery off.
fn may_switch_out(depth: u32, what: &str) -> bool {
    if depth == 0 {
        return true;
    }
    klog_error!("sched: {} inside a disable scope (depth {}) refused", what, depth);
    false
}

// -- Bare-metal switching -----------------------------------------------------

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod arch {
    use core::cell::UnsafeCell;
    use core::sync::atomic::{AtomicPtr, AtomicU8, AtomicU32, AtomicUsize, Ordering};

    use kestrel_abi::{MAX_CPUS, MAX_THREADS, THREAD_STACK_SIZE, ThreadId};
    use kestrel_lib::switch::{SwitchContext, seed_stack, switch_registers, switch_stack_and_call};
    use kestrel_lib::{fatal, klog_warn, pcr};

    use super::{ContextSwitch, RunOutcome};
    use crate::intr;
    use crate::task::{self, Thread};

    const NO_SLOT: usize = usize::MAX;

    #[repr(C, align(16))]
    struct Stack([u8; THREAD_STACK_SIZE]);

    struct Stacks(UnsafeCell<[Stack; MAX_THREADS]>);
    // SAFETY: a stack is only touched by the thread owning its slot.
    unsafe impl Sync for Stacks {}

    struct ThreadContexts(UnsafeCell<[SwitchContext; MAX_THREADS]>);
    // SAFETY: a context is written only by the switch into or out of its slot,
    // which runs with delivery disabled on the owning CPU.
    unsafe impl Sync for ThreadContexts {}

    struct CpuContexts(UnsafeCell<[SwitchContext; MAX_CPUS]>);
    // SAFETY: indexed by the executing CPU only.
    unsafe impl Sync for CpuContexts {}

    static STACKS: Stacks =
        Stacks(UnsafeCell::new([const { Stack([0; THREAD_STACK_SIZE]) }; MAX_THREADS]));
    static THREAD_CTX: ThreadContexts =
        ThreadContexts(UnsafeCell::new([SwitchContext::zero(); MAX_THREADS]));
    static SCHED_CTX: CpuContexts = CpuContexts(UnsafeCell::new([SwitchContext::zero(); MAX_CPUS]));

    /// Thread id a slot's stack was last seeded for.
    static SEEDED_FOR: [AtomicU32; MAX_THREADS] =
        [const { AtomicU32::new(ThreadId::NONE_RAW) }; MAX_THREADS];
    static RUNNING_SLOT: [AtomicUsize; MAX_CPUS] = [const { AtomicUsize::new(NO_SLOT) }; MAX_CPUS];
    static OUTCOME: [AtomicU8; MAX_CPUS] = [const { AtomicU8::new(0) }; MAX_CPUS];
    static CONTINUATION: [AtomicPtr<()>; MAX_CPUS] =
        [const { AtomicPtr::new(core::ptr::null_mut()) }; MAX_CPUS];

    fn stack_top(slot: usize) -> u64 {
        let base = STACKS.0.get() as *mut Stack as u64;
        base + ((slot + 1) * THREAD_STACK_SIZE) as u64
    }

    fn thread_ctx(slot: usize) -> *mut SwitchContext {
        // SAFETY: slot < MAX_THREADS, checked by the task table.
        unsafe { (THREAD_CTX.0.get() as *mut SwitchContext).add(slot) }
    }

    fn sched_ctx(cpu: usize) -> *mut SwitchContext {
        // SAFETY: cpu < MAX_CPUS, clamped by pcr.
        unsafe { (SCHED_CTX.0.get() as *mut SwitchContext).add(cpu) }
    }

    pub struct ArchSwitch;

    impl ContextSwitch for ArchSwitch {
        fn run(&self, thread: &Thread) -> RunOutcome {
            let cpu = pcr::get_current_cpu();
            let slot = thread.slot();

            if SEEDED_FOR[slot].swap(thread.id.0, Ordering::AcqRel) != thread.id.0 {
                let top = stack_top(slot);
                // SAFETY: the slot's previous owner has exited and been
                // reaped, so nothing runs on this stack.
                unsafe {
                    seed_stack(top, thread_start);
                    *thread_ctx(slot) = SwitchContext::new_for_entry(top);
                }
            }

            OUTCOME[cpu].store(0, Ordering::Relaxed);
            RUNNING_SLOT[cpu].store(slot, Ordering::Release);
            {
                let _irq = intr::guard();
                // SAFETY: delivery is off; the thread context is either
                // freshly seeded or was saved by its last switch out.
                unsafe { switch_registers(sched_ctx(cpu), thread_ctx(slot)) };
            }
            RUNNING_SLOT[cpu].store(NO_SLOT, Ordering::Release);

            RunOutcome::from_raw(OUTCOME[cpu].load(Ordering::Acquire)).unwrap_or_else(|| {
                klog_warn!("sched: {} returned without an outcome", thread.id);
                RunOutcome::Yielded
            })
        }

        fn idle(&self, has_work: &dyn Fn() -> bool) {
            if intr::depth() != 0 {
                core::hint::spin_loop();
                return;
            }
            intr::disable();
            if has_work() {
                intr::enable();
            } else {
                intr::controller().enable_and_halt();
            }
        }
    }

    extern "C" fn thread_start() -> ! {
        // Close the scope the scheduler switched in with.
        intr::enable();
        let entry = task::thr_current()
            .and_then(|tid| task::tasks().with(|t| t.thread(tid).and_then(|th| th.entry)));
        match entry {
            Some(entry) => entry(),
            None => klog_warn!("sched: thread without entry started"),
        }
        exit_current()
    }

    /// Hand the CPU back to this CPU's scheduler with `outcome`.
    ///
    /// # Safety
    ///
    /// Must run on a thread started by `ArchSwitch::run` at nesting depth one.
    unsafe fn switch_out(cpu: usize, slot: usize, outcome: RunOutcome) {
        OUTCOME[cpu].store(outcome as u8, Ordering::Release);
        unsafe { switch_registers(thread_ctx(slot), sched_ctx(cpu)) };
    }

    fn running_slot(cpu: usize) -> Option<usize> {
        match RUNNING_SLOT[cpu].load(Ordering::Acquire) {
            NO_SLOT => None,
            slot => Some(slot),
        }
    }

    pub fn yield_now() {
        let cpu = pcr::get_current_cpu();
        let Some(slot) = running_slot(cpu) else {
            return;
        };
        if !super::may_switch_out(intr::depth(), "yield") {
            return;
        }
        let _irq = intr::guard();
        // SAFETY: depth is one and we are the thread in `slot`.
        unsafe { switch_out(cpu, slot, RunOutcome::Yielded) };
    }

    pub fn exit_current() -> ! {
        let cpu = pcr::get_current_cpu();
        let Some(slot) = running_slot(cpu) else {
            fatal!("sched: exit outside of a thread");
        };
        if !super::may_switch_out(intr::depth(), "exit") {
            fatal!("sched: exit on cpu {} inside a disable scope", cpu);
        }
        intr::disable();
        // SAFETY: as in `yield_now`. The scheduler never switches back to an
        // exited thread.
        unsafe { switch_out(cpu, slot, RunOutcome::Exited) };
        fatal!("sched: exited thread resumed")
    }

    /// Preemption point on the way out of a device interrupt.
    pub fn preempt_from_trap() {
        let cpu = pcr::get_current_cpu();
        let Some(slot) = running_slot(cpu) else {
            return;
        };
        if !super::take_reschedule() {
            return;
        }
        intr::controller().with_trap_scope(|| {
            // SAFETY: delivery was masked by the trap gate and the trap scope
            // puts the depth at one.
            unsafe { switch_out(cpu, slot, RunOutcome::Yielded) };
        });
    }

    extern "C" fn bootstrap_trampoline() -> ! {
        let cpu = pcr::get_current_cpu();
        let raw = CONTINUATION[cpu].load(Ordering::Acquire);
        if raw.is_null() {
            fatal!("sched: bootstrap continuation missing");
        }
        // SAFETY: only `transfer` stores here, and it stores a `fn() -> !`.
        let cont: fn() -> ! = unsafe { core::mem::transmute(raw) };
        cont()
    }

    pub fn transfer(thread: &Thread, cont: fn() -> !) -> ! {
        let cpu = pcr::get_current_cpu();
        let slot = thread.slot();
        SEEDED_FOR[slot].store(thread.id.0, Ordering::Release);
        CONTINUATION[cpu].store(cont as *mut (), Ordering::Release);
        // SAFETY: the slot's stack belongs to the freshly created bootstrap
        // thread and is unused. The boot stack is abandoned.
        unsafe { switch_stack_and_call(stack_top(slot), bootstrap_trampoline) }
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use arch::{ArchSwitch, exit_current, preempt_from_trap, yield_now};

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub type NativeSwitch = ArchSwitch;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
const NATIVE_SWITCH: NativeSwitch = ArchSwitch;

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub type NativeSwitch = DirectSwitch;
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
const NATIVE_SWITCH: NativeSwitch = DirectSwitch;

/// Cooperative yield. Entries run to completion on hosted builds, so only
/// the scope check remains.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn yield_now() {
    may_switch_out(intr::depth(), "yield");
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn exit_current() -> ! {
    fatal!("sched: exit outside of a thread")
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn preempt_from_trap() {
    take_reschedule();
}

/// Transfer control to `tid` directly, bypassing the scheduler, and continue
/// the caller's work in `cont` on that thread's context. The caller never
/// resumes.
pub fn bootstrap_transfer(tasks: &Tasks, tid: ThreadId, cont: fn() -> !) -> ! {
    let thread = match tasks.with(|t| -> Result<Thread, task::TaskError> {
        t.set_state(tid, ThreadState::Running)?;
        t.thread(tid).copied().ok_or(task::TaskError::NoSuchThread(tid))
    }) {
        Ok(thread) => thread,
        Err(err) => fatal!("sched: bootstrap transfer to {} failed: {}", tid, err),
    };
    tasks.set_current(Some(tid));
    klog_debug!("sched: bootstrap transfer to {}", tid);

    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        arch::transfer(&thread, cont)
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let _ = thread;
        cont()
    }
}

// -- Kernel instance ----------------------------------------------------------

static SCHED: Scheduler = Scheduler::new();

pub fn sched_add(tid: ThreadId) -> Result<(), SchedError> {
    SCHED.add(task::tasks(), tid)
}

/// Run the kernel scheduler on this CPU. Returning at all is a fatal
/// condition for the caller.
pub fn sched_start() -> SchedStop {
    SCHED.start(task::tasks(), &NATIVE_SWITCH)
}

pub fn sched_stats() -> SchedStats {
    SCHED.stats()
}
