//! Demand page commit
//!
//! The static analysis cannot see every page guest code will touch; an
//! access to reserved-but-uncommitted guest memory surfaces as a host
//! protection fault. This observer claims faults inside the guest span,
//! commits exactly the containing page, and resumes so the access
//! repeats successfully. Anything it cannot repair is declined for the
//! next observer.

use std::sync::Arc;

use ox_core::diag::{DiagnosticCounters, WarnCategory};
use ox_memory::AddressSpace;

use crate::observer::{FaultDisposition, FaultInfo, FaultObserver};
use crate::stderr::raw_log;

/// Commits missing guest pages on first touch
pub struct DemandCommitObserver {
    space: Arc<AddressSpace>,
    diag: Arc<DiagnosticCounters>,
}

impl DemandCommitObserver {
    /// Chain priority. Must stay below any MMIO interception the
    /// embedder installs, so legitimate device faults are serviced
    /// first.
    pub const PRIORITY: i32 = 0;

    pub fn new(space: Arc<AddressSpace>, diag: Arc<DiagnosticCounters>) -> Self {
        Self { space, diag }
    }
}

impl FaultObserver for DemandCommitObserver {
    fn name(&self) -> &'static str {
        "demand-commit"
    }

    fn on_fault(&self, fault: &FaultInfo) -> FaultDisposition {
        if !self.space.contains_host(fault.addr) {
            return FaultDisposition::Decline;
        }

        let guest_addr = fault.addr - self.space.base() as u64;

        match self.space.commit_host_page(fault.addr) {
            Ok(page) => {
                if let Some(n) = self.diag.note(WarnCategory::PageCommit) {
                    raw_log!(
                        "[PAGECOMMIT] Committed page for guest 0x{:08X} (host 0x{:016X}) {} ({}/{})",
                        guest_addr,
                        page,
                        fault.kind,
                        n,
                        WarnCategory::PageCommit.cap()
                    );
                }
                FaultDisposition::Resume
            }
            Err(err) => {
                if let Some(n) = self.diag.note(WarnCategory::CommitFailure) {
                    raw_log!(
                        "[PAGECOMMIT] FAILED to commit page for guest 0x{:08X}: {} ({}/{})",
                        guest_addr,
                        err,
                        n,
                        WarnCategory::CommitFailure.cap()
                    );
                }
                FaultDisposition::Decline
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::HostContext;
    use ox_core::error::AccessKind;

    fn fault_at(addr: u64, kind: AccessKind) -> FaultInfo {
        FaultInfo {
            code: 11,
            addr,
            kind,
            host: HostContext::default(),
        }
    }

    #[test]
    fn test_commits_faults_inside_guest_span() {
        let space = AddressSpace::reserve().unwrap();
        let diag = Arc::new(DiagnosticCounters::new());
        let observer = DemandCommitObserver::new(space.clone(), diag.clone());

        let host = space.base() as u64 + space.layout().heap_base as u64 + 0x2340;
        assert_eq!(
            observer.on_fault(&fault_at(host, AccessKind::Write)),
            FaultDisposition::Resume
        );
        assert_eq!(diag.occurrences(WarnCategory::PageCommit), 1);

        // The page is live now; the access that faulted will repeat and
        // succeed without another fault.
        let guest = space.layout().heap_base as u64 + 0x2340;
        space.write_be32(guest, 0x5A5A5A5A).unwrap();
        assert_eq!(space.read_be32(guest).unwrap(), 0x5A5A5A5A);
    }

    #[test]
    fn test_declines_faults_outside_guest_span() {
        let space = AddressSpace::reserve().unwrap();
        let diag = Arc::new(DiagnosticCounters::new());
        let observer = DemandCommitObserver::new(space.clone(), diag.clone());

        let below = space.base() as u64 - 0x1000;
        let above = space.base() as u64 + ox_memory::GUEST_SPAN + 0x1000;

        assert_eq!(
            observer.on_fault(&fault_at(below, AccessKind::Read)),
            FaultDisposition::Decline
        );
        assert_eq!(
            observer.on_fault(&fault_at(above, AccessKind::Read)),
            FaultDisposition::Decline
        );
        assert_eq!(diag.occurrences(WarnCategory::PageCommit), 0);
        assert_eq!(diag.occurrences(WarnCategory::CommitFailure), 0);
    }

    #[test]
    fn test_commit_logging_is_rate_limited() {
        let space = AddressSpace::reserve().unwrap();
        let diag = Arc::new(DiagnosticCounters::new());
        let observer = DemandCommitObserver::new(space.clone(), diag.clone());

        let cap = WarnCategory::PageCommit.cap();
        let base = space.base() as u64 + space.layout().heap_base as u64;
        for i in 0..cap * 10 {
            observer.on_fault(&fault_at(base + i * 0x1000, AccessKind::Read));
        }

        assert_eq!(diag.occurrences(WarnCategory::PageCommit), cap * 10);
        assert_eq!(diag.emitted(WarnCategory::PageCommit), cap);
    }
}
