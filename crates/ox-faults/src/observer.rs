//! Fault observer chain
//!
//! Hardware exception handlers restated as data: each observer is a
//! decision from a fault description to a disposition, and the chain
//! tries them in descending priority until one resumes. The platform
//! registration mechanism lives in [`crate::platform`]; everything here
//! is portable and runs the same under tests with synthetic faults.

use ox_core::error::AccessKind;

/// Host register snapshot at the moment of the fault
#[derive(Debug, Clone, Copy, Default)]
pub struct HostContext {
    /// Faulting instruction pointer
    pub ip: u64,
    /// Stack pointer
    pub sp: u64,
    /// General purpose registers, in [`GPR_NAMES`] order. All zero on
    /// platforms where the adapter cannot recover them.
    pub gpr: [u64; 16],
}

/// Register names matching `HostContext::gpr`
pub const GPR_NAMES: [&str; 16] = [
    "RAX", "RBX", "RCX", "RDX", "RSI", "RDI", "RBP", "RSP", "R8", "R9", "R10", "R11", "R12",
    "R13", "R14", "R15",
];

/// One delivered hardware fault
#[derive(Debug, Clone, Copy)]
pub struct FaultInfo {
    /// Platform exception code (signal number or NTSTATUS)
    pub code: u32,
    /// Address whose access faulted
    pub addr: u64,
    pub kind: AccessKind,
    pub host: HostContext,
}

/// What an observer decided about a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDisposition {
    /// The fault was repaired; resume at the faulting instruction
    Resume,
    /// Not this observer's fault; let the next one (or the platform
    /// default) have it
    Decline,
}

/// A prioritized fault handler. Runs on whatever thread faulted, in
/// hardware-interrupt-like context: no allocation, no app locks, no
/// tracing subscriber.
pub trait FaultObserver: Send + Sync {
    fn name(&self) -> &'static str;
    fn on_fault(&self, fault: &FaultInfo) -> FaultDisposition;
}

struct ChainEntry {
    priority: i32,
    observer: Box<dyn FaultObserver>,
}

/// Observers ordered by descending priority
///
/// Built during startup, immutable once installed; dispatch takes no
/// locks.
#[derive(Default)]
pub struct FaultChain {
    entries: Vec<ChainEntry>,
}

impl FaultChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an observer. Higher priority runs earlier; equal priorities
    /// keep registration order.
    pub fn register(&mut self, priority: i32, observer: Box<dyn FaultObserver>) {
        let at = self
            .entries
            .iter()
            .position(|e| e.priority < priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(at, ChainEntry { priority, observer });
    }

    /// Offer the fault to each observer in turn
    pub fn dispatch(&self, fault: &FaultInfo) -> FaultDisposition {
        for entry in &self.entries {
            if entry.observer.on_fault(fault) == FaultDisposition::Resume {
                return FaultDisposition::Resume;
            }
        }
        FaultDisposition::Decline
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
