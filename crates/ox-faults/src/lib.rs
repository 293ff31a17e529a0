//! Hardware fault handling for the oxidized-xenon substrate
//!
//! Recompiled code runs with guest memory only reserved, not fully
//! committed, and with no software bounds checks on guest pointers.
//! Both choices lean on the host MMU: a bad or first-touch access
//! faults, and this crate decides what happens next. Observers form a
//! prioritized chain; the demand-commit observer repairs first-touch
//! faults, the crash reporter documents everything else on the way
//! down.

pub mod commit;
pub mod observer;
pub mod platform;
pub mod report;
pub(crate) mod stderr;

pub use commit::DemandCommitObserver;
pub use observer::{
    FaultChain, FaultDisposition, FaultInfo, FaultObserver, HostContext, GPR_NAMES,
};
pub use platform::{install, FaultHandlerGuard};
pub use report::CrashReporter;
