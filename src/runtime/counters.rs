use std::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Entry statistics of the lock fast paths.
#[derive(Default)]
pub struct BiasedLockingCounters {
    pub total_entry_count: AtomicUsize,
    pub biased_lock_entry_count: AtomicUsize,
    pub anonymously_biased_lock_entry_count: AtomicUsize,
    pub rebiased_lock_entry_count: AtomicUsize,
    pub revoked_lock_entry_count: AtomicUsize,
    pub fast_path_entry_count: AtomicUsize,
    pub slow_path_entry_count: AtomicUsize,
}

#[inline(always)]
pub(crate) fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl BiasedLockingCounters {
    pub const fn new() -> Self {
        Self {
            total_entry_count: AtomicUsize::new(0),
            biased_lock_entry_count: AtomicUsize::new(0),
            anonymously_biased_lock_entry_count: AtomicUsize::new(0),
            rebiased_lock_entry_count: AtomicUsize::new(0),
            revoked_lock_entry_count: AtomicUsize::new(0),
            fast_path_entry_count: AtomicUsize::new(0),
            slow_path_entry_count: AtomicUsize::new(0),
        }
    }

    pub fn nonzero(&self) -> bool {
        self.total_entry_count.load(Ordering::Relaxed) > 0
    }

    fn rows(&self) -> [(&'static str, usize); 7] {
        let get = |c: &AtomicUsize| c.load(Ordering::Relaxed);
        [
            ("Total entry count", get(&self.total_entry_count)),
            ("Biased lock entry count", get(&self.biased_lock_entry_count)),
            (
                "Anonymously biased lock entry count",
                get(&self.anonymously_biased_lock_entry_count),
            ),
            ("Rebiased lock entry count", get(&self.rebiased_lock_entry_count)),
            ("Revoked lock entry count", get(&self.revoked_lock_entry_count)),
            ("Fast path lock entry count", get(&self.fast_path_entry_count)),
            ("Slow path lock entry count", get(&self.slow_path_entry_count)),
        ]
    }
}

impl fmt::Display for BiasedLockingCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.rows() {
            writeln!(f, "# {:<36}: {}", name, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_lists_every_counter() {
        let counters = BiasedLockingCounters::new();
        assert!(!counters.nonzero());
        bump(&counters.total_entry_count);
        bump(&counters.rebiased_lock_entry_count);
        assert!(counters.nonzero());
        let text = counters.to_string();
        assert_eq!(text.lines().count(), 7);
        assert!(text.contains("Rebiased lock entry count"));
        assert!(text
            .lines()
            .any(|l| l.starts_with("# Total entry count") && l.ends_with(": 1")));
    }
}
