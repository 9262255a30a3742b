//! Process and thread types shared between kernel subsystems.
//!
//! The scheduler, the boot orchestrator and the trap path all reason about
//! the same lifecycle states; this module is the single source of truth for
//! them and for the identity types handed across crate boundaries.

use core::fmt;

// --- Identity ---

/// Process identity. Index into the process table plus one, never zero.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u32);

/// Thread identity. Monotonic, never reused while the kernel runs.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u32);

impl ThreadId {
    /// Raw sentinel used by per-CPU slots to mean "no thread".
    pub const NONE_RAW: u32 = 0;

    #[inline]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        if raw == Self::NONE_RAW {
            None
        } else {
            Some(Self(raw))
        }
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid {}", self.0)
    }
}

/// Handle to an address space: the physical address of its root page table.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpaceHandle(pub u64);

impl SpaceHandle {
    #[inline]
    pub const fn root(self) -> u64 {
        self.0
    }
}

// --- Scheduling class ---

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    High = 0,
    #[default]
    Normal = 1,
    Low = 2,
    Idle = 3,
}

/// CPU privilege level a process executes at.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ring {
    Kernel = 0,
    User = 3,
}

// --- ThreadState ---

/// Thread lifecycle state with explicit state-machine semantics.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ThreadState {
    /// Eligible to run, waiting in the ready set.
    #[default]
    Runnable = 1,
    /// Currently executing on a CPU.
    Running = 2,
    /// Suspended pending an event.
    Blocked = 3,
    /// Terminal. Never scheduled again.
    Exited = 4,
}

impl ThreadState {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Runnable),
            2 => Some(Self::Running),
            3 => Some(Self::Blocked),
            4 => Some(Self::Exited),
            _ => None,
        }
    }

    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Exited)
    }

    #[inline]
    pub const fn can_transition_to(self, target: Self) -> bool {
        match self {
            Self::Runnable => matches!(target, Self::Running | Self::Exited),
            Self::Running => matches!(target, Self::Runnable | Self::Blocked | Self::Exited),
            Self::Blocked => matches!(target, Self::Runnable | Self::Exited),
            Self::Exited => false,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Runnable => "runnable",
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Exited => "exited",
        }
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_state_machine() {
        assert!(ThreadState::Runnable.can_transition_to(ThreadState::Running));
        assert!(ThreadState::Running.can_transition_to(ThreadState::Blocked));
        assert!(ThreadState::Blocked.can_transition_to(ThreadState::Runnable));
        assert!(!ThreadState::Runnable.can_transition_to(ThreadState::Blocked));
        for target in [
            ThreadState::Runnable,
            ThreadState::Running,
            ThreadState::Blocked,
            ThreadState::Exited,
        ] {
            assert!(!ThreadState::Exited.can_transition_to(target));
        }
    }

    #[test]
    fn test_thread_state_raw_roundtrip() {
        assert_eq!(ThreadState::from_u8(0), None);
        assert_eq!(ThreadState::from_u8(ThreadState::Blocked.as_u8()), Some(ThreadState::Blocked));
        assert_eq!(ThreadId::from_raw(ThreadId::NONE_RAW), None);
        assert_eq!(ThreadId::from_raw(7), Some(ThreadId(7)));
    }
}
