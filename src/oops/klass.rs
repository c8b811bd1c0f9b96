use std::{fmt, sync::atomic::Ordering};

use crate::runtime::{biased_locking, safepoint::AtSafepoint};

use super::mark_word::{AtomicMarkWord, MarkWord};

/// Per-class metadata consulted by the locking protocols.
///
/// The prototype header is the mark every new instance starts with. For
/// biasable classes it carries the bias pattern and the current bias epoch.
pub struct Klass {
    name: &'static str,
    prototype_header: AtomicMarkWord,
}

impl Klass {
    /// A class whose instances start out neutral.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            prototype_header: AtomicMarkWord::new(MarkWord::prototype()),
        }
    }

    /// A class whose instances start out anonymously biased.
    pub const fn new_biasable(name: &'static str) -> Self {
        Self {
            name,
            prototype_header: AtomicMarkWord::new(MarkWord::biased_locking_prototype()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn prototype_header(&self) -> MarkWord {
        self.prototype_header.load(Ordering::Acquire)
    }

    pub fn set_prototype_header(&self, header: MarkWord, _at: &AtSafepoint) {
        self.prototype_header.store(header, Ordering::Release);
    }

    pub fn is_biasable(&self) -> bool {
        self.prototype_header().has_bias_pattern()
    }

    pub fn bias_epoch(&self) -> usize {
        self.prototype_header().bias_epoch()
    }

    /// Invalidates every outstanding bias toward instances of this class that
    /// is not currently held.
    pub fn bulk_rebias(&self, at: &AtSafepoint) {
        biased_locking::bulk_rebias(self, at)
    }

    /// Disables biasing for this class and revokes the held biases.
    pub fn bulk_revoke(&self, at: &AtSafepoint) {
        biased_locking::bulk_revoke(self, at)
    }
}

impl fmt::Debug for Klass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Klass")
            .field("name", &self.name)
            .field("prototype_header", &self.prototype_header())
            .finish()
    }
}
