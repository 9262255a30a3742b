//! Capacities of the kernel's statically sized tables.

/// Number of interrupt gates (x86_64 IDT vectors).
pub const NUM_GATES: usize = 256;

/// Maximum number of handlers chained on a single gate.
pub const MAX_HANDLERS_PER_GATE: usize = 8;

/// Maximum number of CPUs tracked by per-CPU state arrays.
pub const MAX_CPUS: usize = 64;

/// Maximum number of registrations per extension phase.
pub const MAX_EXTENSIONS_PER_PHASE: usize = 32;

/// Process table capacity.
pub const MAX_PROCESSES: usize = 16;

/// Thread table capacity. Also bounds the scheduler's ready set.
pub const MAX_THREADS: usize = 64;

/// Threads a single process can own.
pub const MAX_THREADS_PER_PROCESS: usize = 16;

/// Kernel stack size for each thread (32 KiB).
pub const THREAD_STACK_SIZE: usize = 32 * 1024;

/// System timer frequency.
pub const TIMER_HZ: u32 = 100;
