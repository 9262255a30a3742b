use core::sync::atomic::{AtomicBool, Ordering};

/// One-way "initialized" latch for subsystems with static state.
pub struct InitFlag {
    set: AtomicBool,
}

impl InitFlag {
    pub const fn new() -> Self {
        Self {
            set: AtomicBool::new(false),
        }
    }

    /// Set the flag. Returns `true` only for the caller that flipped it.
    #[inline]
    pub fn init_once(&self) -> bool {
        self.set
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn mark_set(&self) {
        self.set.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }
}

impl Default for InitFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_once_only_first_caller_wins() {
        let flag = InitFlag::new();
        assert!(!flag.is_set());
        assert!(flag.init_once());
        assert!(!flag.init_once());
        assert!(flag.is_set());
    }
}
