//! Rate-limited diagnostic counters
//!
//! Every recoverable failure in the substrate belongs to one warning
//! category with a fixed emission cap. The counters keep counting past
//! the cap, but callers stop emitting log lines once it is reached, so a
//! persistently failing call site inside a hot loop produces bounded
//! output. Counts are advisory; increments are relaxed.

use std::sync::atomic::{AtomicU64, Ordering};

/// Warning categories with independent rate limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarnCategory {
    /// Indirect call to a null target
    NullCall,
    /// Indirect call target outside both the code range and any thunk
    OutOfRangeCall,
    /// In-range target with no registered function
    UnresolvedCall,
    /// Import thunk decoded, but the true target has no registered function
    ThunkUnresolved,
    /// Demand page commit performed by the fault observer
    PageCommit,
    /// Demand page commit attempted and failed
    CommitFailure,
}

const CATEGORY_COUNT: usize = 6;

impl WarnCategory {
    /// Maximum number of log lines emitted for this category
    pub fn cap(self) -> u64 {
        match self {
            Self::NullCall => 5,
            Self::OutOfRangeCall => 20,
            Self::UnresolvedCall => 50,
            Self::ThunkUnresolved => 20,
            Self::PageCommit => 50,
            Self::CommitFailure => 10,
        }
    }

    /// Tag prefix used in diagnostic lines
    pub fn tag(self) -> &'static str {
        match self {
            Self::NullCall | Self::OutOfRangeCall | Self::UnresolvedCall => "WARN",
            Self::ThunkUnresolved => "THUNK",
            Self::PageCommit | Self::CommitFailure => "PAGECOMMIT",
        }
    }

    fn index(self) -> usize {
        match self {
            Self::NullCall => 0,
            Self::OutOfRangeCall => 1,
            Self::UnresolvedCall => 2,
            Self::ThunkUnresolved => 3,
            Self::PageCommit => 4,
            Self::CommitFailure => 5,
        }
    }
}

/// Process-wide diagnostic counter state
///
/// Constructed once by the embedder and injected into the dispatcher and
/// the fault observers. Never reset, never persisted.
#[derive(Debug, Default)]
pub struct DiagnosticCounters {
    occurrences: [AtomicU64; CATEGORY_COUNT],
    emitted: [AtomicU64; CATEGORY_COUNT],
}

impl DiagnosticCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one occurrence. Returns the occurrence number while the
    /// category is under its cap, `None` once it is suppressed.
    pub fn note(&self, cat: WarnCategory) -> Option<u64> {
        let n = self.occurrences[cat.index()].fetch_add(1, Ordering::Relaxed) + 1;
        if n <= cat.cap() {
            self.emitted[cat.index()].fetch_add(1, Ordering::Relaxed);
            Some(n)
        } else {
            None
        }
    }

    /// Total occurrences recorded for a category
    pub fn occurrences(&self, cat: WarnCategory) -> u64 {
        self.occurrences[cat.index()].load(Ordering::Relaxed)
    }

    /// Number of log lines actually emitted for a category
    pub fn emitted(&self, cat: WarnCategory) -> u64 {
        self.emitted[cat.index()].load(Ordering::Relaxed)
    }
}
