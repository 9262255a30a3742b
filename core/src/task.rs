//! Processes and threads.
//!
//! A process owns an address space and the set of its threads; a thread
//! refers to its process by id only. Both live in fixed tables inside a
//! [`TaskTable`]. The kernel's table is the [`TASKS`] static, wrapped in a
//! lock that is only taken with interrupt delivery disabled so the timer
//! path can never spin on a lock held by the thread it interrupted.

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use kestrel_abi::{
    MAX_CPUS, MAX_PROCESSES, MAX_THREADS, MAX_THREADS_PER_PROCESS, Priority, ProcessId, Ring,
    SpaceHandle, ThreadId, ThreadState,
};
use kestrel_lib::{klog_debug, pcr};
use spin::{Mutex, Once};

use crate::intr;

/// Body of a thread.
pub type ThreadEntry = fn();

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskError {
    ProcessTableFull,
    ThreadTableFull,
    ProcessThreadsFull(ProcessId),
    NoSuchProcess(ProcessId),
    NoSuchThread(ThreadId),
    InvalidTransition {
        thread: ThreadId,
        from: ThreadState,
        to: ThreadState,
    },
    CoreProcessAlreadySet,
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::ProcessTableFull => f.write_str("process table full"),
            TaskError::ThreadTableFull => f.write_str("thread table full"),
            TaskError::ProcessThreadsFull(pid) => write!(f, "{} has no room for threads", pid),
            TaskError::NoSuchProcess(pid) => write!(f, "no such process: {}", pid),
            TaskError::NoSuchThread(tid) => write!(f, "no such thread: {}", tid),
            TaskError::InvalidTransition { thread, from, to } => {
                write!(f, "{}: invalid transition {} -> {}", thread, from, to)
            }
            TaskError::CoreProcessAlreadySet => f.write_str("core process already set"),
        }
    }
}

/// Thread ids of one process, in creation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadSet {
    ids: [ThreadId; MAX_THREADS_PER_PROCESS],
    len: usize,
}

impl ThreadSet {
    const EMPTY: Self = Self {
        ids: [ThreadId(ThreadId::NONE_RAW); MAX_THREADS_PER_PROCESS],
        len: 0,
    };

    #[inline]
    pub fn as_slice(&self) -> &[ThreadId] {
        &self.ids[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn push(&mut self, tid: ThreadId) -> bool {
        if self.len >= MAX_THREADS_PER_PROCESS {
            return false;
        }
        self.ids[self.len] = tid;
        self.len += 1;
        true
    }

    fn remove(&mut self, tid: ThreadId) {
        if let Some(pos) = self.as_slice().iter().position(|&t| t == tid) {
            self.ids.copy_within(pos + 1..self.len, pos);
            self.len -= 1;
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Process {
    pub id: ProcessId,
    pub space: SpaceHandle,
    pub priority: Priority,
    pub ring: Ring,
    threads: ThreadSet,
}

impl Process {
    #[inline]
    pub fn threads(&self) -> &[ThreadId] {
        self.threads.as_slice()
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Thread {
    pub id: ThreadId,
    pub process: ProcessId,
    /// `None` for the bootstrap thread, which has no body of its own.
    pub entry: Option<ThreadEntry>,
    pub state: ThreadState,
    slot: usize,
}

impl Thread {
    /// Index of this thread's slot in the thread table. Stable for the
    /// thread's lifetime; per-thread resources such as stacks are keyed on it.
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }
}

pub struct TaskTable {
    processes: [Option<Process>; MAX_PROCESSES],
    threads: [Option<Thread>; MAX_THREADS],
    next_tid: u32,
}

impl TaskTable {
    pub const fn new() -> Self {
        Self {
            processes: [None; MAX_PROCESSES],
            threads: [None; MAX_THREADS],
            next_tid: 1,
        }
    }

    /// Create a process owning `space`. It starts without threads.
    pub fn prc_new(
        &mut self,
        space: SpaceHandle,
        priority: Priority,
        ring: Ring,
    ) -> Result<ProcessId, TaskError> {
        let slot = self
            .processes
            .iter()
            .position(Option::is_none)
            .ok_or(TaskError::ProcessTableFull)?;
        let id = ProcessId(slot as u32 + 1);
        self.processes[slot] = Some(Process {
            id,
            space,
            priority,
            ring,
            threads: ThreadSet::EMPTY,
        });
        klog_debug!("task: {} created, space root {:#x}", id, space.root());
        Ok(id)
    }

    pub fn process(&self, pid: ProcessId) -> Option<&Process> {
        let slot = (pid.0 as usize).checked_sub(1)?;
        self.processes.get(slot)?.as_ref()
    }

    fn process_mut(&mut self, pid: ProcessId) -> Result<&mut Process, TaskError> {
        (pid.0 as usize)
            .checked_sub(1)
            .and_then(|slot| self.processes.get_mut(slot))
            .and_then(Option::as_mut)
            .ok_or(TaskError::NoSuchProcess(pid))
    }

    /// Create a `Runnable` thread under `pid` with a fresh identity.
    pub fn thr_create(
        &mut self,
        pid: ProcessId,
        entry: Option<ThreadEntry>,
    ) -> Result<ThreadId, TaskError> {
        let slot = self
            .threads
            .iter()
            .position(Option::is_none)
            .ok_or(TaskError::ThreadTableFull)?;
        let id = ThreadId(self.next_tid);

        let process = self.process_mut(pid)?;
        if !process.threads.push(id) {
            return Err(TaskError::ProcessThreadsFull(pid));
        }

        self.next_tid += 1;
        self.threads[slot] = Some(Thread {
            id,
            process: pid,
            entry,
            state: ThreadState::Runnable,
            slot,
        });
        klog_debug!("task: {} created under {}", id, pid);
        Ok(id)
    }

    pub fn thread(&self, tid: ThreadId) -> Option<&Thread> {
        self.threads.iter().flatten().find(|t| t.id == tid)
    }

    fn thread_mut(&mut self, tid: ThreadId) -> Result<&mut Thread, TaskError> {
        self.threads
            .iter_mut()
            .flatten()
            .find(|t| t.id == tid)
            .ok_or(TaskError::NoSuchThread(tid))
    }

    pub fn state(&self, tid: ThreadId) -> Option<ThreadState> {
        self.thread(tid).map(|t| t.state)
    }

    /// Move `tid` to `state` along a legal lifecycle edge. Returns the
    /// previous state.
    pub fn set_state(&mut self, tid: ThreadId, state: ThreadState) -> Result<ThreadState, TaskError> {
        let thread = self.thread_mut(tid)?;
        let from = thread.state;
        if !from.can_transition_to(state) {
            return Err(TaskError::InvalidTransition {
                thread: tid,
                from,
                to: state,
            });
        }
        thread.state = state;
        Ok(from)
    }

    /// Set `tid` to `state` regardless of the usual edges. An exited thread
    /// still never comes back.
    pub fn force_state(&mut self, tid: ThreadId, state: ThreadState) -> Result<ThreadState, TaskError> {
        let thread = self.thread_mut(tid)?;
        let from = thread.state;
        if from.is_terminal() && from != state {
            return Err(TaskError::InvalidTransition {
                thread: tid,
                from,
                to: state,
            });
        }
        thread.state = state;
        Ok(from)
    }

    /// Drop an exited thread from the tables. Returns whether it was removed.
    pub fn reap(&mut self, tid: ThreadId) -> bool {
        let Some(slot) = self
            .threads
            .iter()
            .position(|t| matches!(t, Some(t) if t.id == tid && t.state.is_terminal()))
        else {
            return false;
        };
        let Some(thread) = self.threads[slot].take() else {
            return false;
        };
        if let Ok(process) = self.process_mut(thread.process) {
            process.threads.remove(tid);
        }
        klog_debug!("task: {} reaped", tid);
        true
    }

    pub fn threads_of(&self, pid: ProcessId) -> Option<ThreadSet> {
        self.process(pid).map(|p| p.threads)
    }

    pub fn count_in(&self, state: ThreadState) -> usize {
        self.threads
            .iter()
            .flatten()
            .filter(|t| t.state == state)
            .count()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.iter().flatten().count()
    }
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}

/// A task table plus the per-CPU "current thread" slots.
pub struct Tasks {
    table: Mutex<TaskTable>,
    current: [AtomicU32; MAX_CPUS],
}

impl Tasks {
    pub const fn new() -> Self {
        Self {
            table: Mutex::new(TaskTable::new()),
            current: [const { AtomicU32::new(ThreadId::NONE_RAW) }; MAX_CPUS],
        }
    }

    /// Run `f` on the table with delivery disabled on this CPU.
    pub fn with<R>(&self, f: impl FnOnce(&mut TaskTable) -> R) -> R {
        let _irq = intr::guard();
        let mut table = self.table.lock();
        f(&mut table)
    }

    /// Thread executing on the calling CPU.
    #[inline]
    pub fn current(&self) -> Option<ThreadId> {
        let cpu = pcr::get_current_cpu();
        ThreadId::from_raw(self.current[cpu].load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_current(&self, tid: Option<ThreadId>) {
        let cpu = pcr::get_current_cpu();
        let raw = tid.map_or(ThreadId::NONE_RAW, |t| t.0);
        self.current[cpu].store(raw, Ordering::Release);
    }
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

// -- Kernel instance ----------------------------------------------------------

pub static TASKS: Tasks = Tasks::new();

static CORE_PROCESS: Once<ProcessId> = Once::new();

#[inline]
pub fn tasks() -> &'static Tasks {
    &TASKS
}

pub fn prc_new(space: SpaceHandle, priority: Priority, ring: Ring) -> Result<ProcessId, TaskError> {
    TASKS.with(|t| t.prc_new(space, priority, ring))
}

pub fn thr_create(pid: ProcessId, entry: Option<ThreadEntry>) -> Result<ThreadId, TaskError> {
    TASKS.with(|t| t.thr_create(pid, entry))
}

/// The thread running on this CPU. Defined once the bootstrap transfer
/// has happened.
pub fn thr_current() -> Option<ThreadId> {
    TASKS.current()
}

pub fn thr_state(tid: ThreadId) -> Option<ThreadState> {
    TASKS.with(|t| t.state(tid))
}

pub fn thr_set_state(tid: ThreadId, state: ThreadState) -> Result<ThreadState, TaskError> {
    TASKS.with(|t| t.set_state(tid, state))
}

pub fn prc_threads(pid: ProcessId) -> Result<ThreadSet, TaskError> {
    TASKS
        .with(|t| t.threads_of(pid))
        .ok_or(TaskError::NoSuchProcess(pid))
}

/// Record the first process in the system. Settable once.
pub fn set_core_process(pid: ProcessId) -> Result<(), TaskError> {
    let mut set = false;
    CORE_PROCESS.call_once(|| {
        set = true;
        pid
    });
    if set {
        Ok(())
    } else {
        Err(TaskError::CoreProcessAlreadySet)
    }
}

pub fn core_process() -> Option<ProcessId> {
    CORE_PROCESS.get().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_core() -> (TaskTable, ProcessId) {
        let mut table = TaskTable::new();
        let pid = table
            .prc_new(SpaceHandle(0x1000), Priority::Normal, Ring::Kernel)
            .unwrap();
        (table, pid)
    }

    #[test]
    fn test_new_process_has_no_threads() {
        let (table, pid) = table_with_core();
        let process = table.process(pid).unwrap();
        assert_eq!(process.space.root(), 0x1000);
        assert_eq!(process.priority, Priority::Normal);
        assert_eq!(process.ring, Ring::Kernel);
        assert!(process.threads().is_empty());
    }

    #[test]
    fn test_thread_starts_runnable_with_fresh_id() {
        fn body() {}

        let (mut table, pid) = table_with_core();
        let boot = table.thr_create(pid, None).unwrap();
        let worker = table.thr_create(pid, Some(body)).unwrap();
        assert_ne!(boot, worker);
        assert_eq!(table.state(boot), Some(ThreadState::Runnable));
        assert!(table.thread(boot).unwrap().entry.is_none());
        assert!(table.thread(worker).unwrap().entry.is_some());
        assert_eq!(table.threads_of(pid).unwrap().as_slice(), &[boot, worker]);
    }

    #[test]
    fn test_thread_requires_live_process() {
        let mut table = TaskTable::new();
        assert_eq!(
            table.thr_create(ProcessId(3), None),
            Err(TaskError::NoSuchProcess(ProcessId(3)))
        );
        assert_eq!(
            table.thr_create(ProcessId(0), None),
            Err(TaskError::NoSuchProcess(ProcessId(0)))
        );
    }

    #[test]
    fn test_state_transitions_are_validated() {
        let (mut table, pid) = table_with_core();
        let tid = table.thr_create(pid, None).unwrap();

        assert!(matches!(
            table.set_state(tid, ThreadState::Blocked),
            Err(TaskError::InvalidTransition { .. })
        ));
        assert_eq!(table.set_state(tid, ThreadState::Running), Ok(ThreadState::Runnable));
        assert_eq!(table.set_state(tid, ThreadState::Exited), Ok(ThreadState::Running));
        assert!(table.set_state(tid, ThreadState::Runnable).is_err());
        assert!(table.force_state(tid, ThreadState::Runnable).is_err());
        assert_eq!(table.state(tid), Some(ThreadState::Exited));
    }

    #[test]
    fn test_reap_only_exited_threads() {
        let (mut table, pid) = table_with_core();
        let a = table.thr_create(pid, None).unwrap();
        let b = table.thr_create(pid, None).unwrap();
        assert!(!table.reap(a));

        table.set_state(a, ThreadState::Exited).unwrap();
        assert!(table.reap(a));
        assert_eq!(table.thread(a).map(|t| t.id), None);
        assert_eq!(table.threads_of(pid).unwrap().as_slice(), &[b]);

        // Slot is reused, identity is not.
        let c = table.thr_create(pid, None).unwrap();
        assert!(c.0 > b.0);
        assert_eq!(table.thread_count(), 2);
    }

    #[test]
    fn test_capacity_limits() {
        let mut table = TaskTable::new();
        for _ in 0..MAX_PROCESSES {
            table.prc_new(SpaceHandle(0), Priority::Low, Ring::User).unwrap();
        }
        assert_eq!(
            table.prc_new(SpaceHandle(0), Priority::Low, Ring::User),
            Err(TaskError::ProcessTableFull)
        );

        let pid = ProcessId(1);
        for _ in 0..MAX_THREADS_PER_PROCESS {
            table.thr_create(pid, None).unwrap();
        }
        assert_eq!(table.thr_create(pid, None), Err(TaskError::ProcessThreadsFull(pid)));
        assert_eq!(table.count_in(ThreadState::Runnable), MAX_THREADS_PER_PROCESS);
    }

    #[test]
    fn test_current_slot_tracks_thread() {
        let tasks = Tasks::new();
        assert_eq!(tasks.current(), None);
        let tid = tasks.with(|t| -> Result<ThreadId, TaskError> {
            let pid = t.prc_new(SpaceHandle(0), Priority::Normal, Ring::Kernel)?;
            t.thr_create(pid, None)
        });
        let tid = tid.unwrap();
        tasks.set_current(Some(tid));
        assert_eq!(tasks.current(), Some(tid));
        tasks.set_current(None);
        assert_eq!(tasks.current(), None);
    }
}
