//! Guest function table
//!
//! A dense, address-indexed table of host function pointers living
//! inside the reservation directly after the image. Every 4-byte guest
//! instruction owns one 8-byte slot, so lookup is a single read. The
//! table is written once during startup, before any guest thread runs,
//! and is read-only afterwards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ox_memory::AddressSpace;
use tracing::{debug, info, warn};

use crate::context::CallContext;

/// A recompiled host function: takes the guest register file and the
/// address space it executes against.
pub type GuestFn = fn(&mut CallContext, &AddressSpace);

/// One entry of the externally generated mapping list
#[derive(Debug, Clone, Copy)]
pub struct FunctionMapping {
    pub guest: u32,
    pub host: Option<GuestFn>,
}

impl FunctionMapping {
    /// Terminating sentinel of a mapping list
    pub const END: FunctionMapping = FunctionMapping {
        guest: 0,
        host: None,
    };

    pub fn new(guest: u32, host: GuestFn) -> Self {
        Self {
            guest,
            host: Some(host),
        }
    }
}

/// Calls that landed on the reserved dynamic-stub slot. The slot holds a
/// plain `GuestFn` with no capture, so the count is process-wide.
static DYNAMIC_STUB_CALLS: AtomicU64 = AtomicU64::new(0);

/// The catch-all handler written into the reserved slot: makes unmapped
/// but in-range call targets observable instead of fatal.
fn dynamic_stub(ctx: &mut CallContext, _space: &AddressSpace) {
    let n = DYNAMIC_STUB_CALLS.fetch_add(1, Ordering::Relaxed) + 1;
    if n <= 10 || n % 0x10000 == 0 {
        warn!(
            "[DYN-STUB] Dynamic stub called (#{}), LR=0x{:08X}, r3=0x{:08X}",
            n,
            ctx.lr as u32,
            ctx.r3() as u32
        );
    }
    ctx.set_r3(0);
}

/// Number of dynamic-stub invocations so far
pub fn dynamic_stub_calls() -> u64 {
    DYNAMIC_STUB_CALLS.load(Ordering::Relaxed)
}

/// Guest-address-indexed table of host function pointers
pub struct FunctionTable {
    space: Arc<AddressSpace>,
}

impl FunctionTable {
    pub fn new(space: Arc<AddressSpace>) -> Self {
        Self { space }
    }

    /// Populate slots from the mapping list, stopping at the sentinel.
    /// Entries outside the code range are data symbols or metadata, not
    /// callable code, and are skipped. Returns the number of slots
    /// written, then installs the dynamic stub in its reserved slot.
    ///
    /// Must complete before any guest instruction executes; unpopulated
    /// slots are null and only the resolver guards against invoking them.
    pub fn populate(&self, mappings: &[FunctionMapping]) -> usize {
        let layout = *self.space.layout();
        let mut count = 0usize;

        for mapping in mappings {
            let Some(host) = mapping.host else { break };
            if let Some(offset) = layout.function_slot_offset(mapping.guest) {
                // Slot offsets stay below the 4 GiB span, so this cannot fail
                let _ = self.space.write::<u64>(offset, host as usize as u64);
                count += 1;
            } else {
                debug!(
                    "Skipping mapping 0x{:08X} outside code range",
                    mapping.guest
                );
            }
        }

        info!("Populated {} function table entries", count);
        self.register_dynamic_stub(layout.dynamic_stub_addr());
        count
    }

    /// Write the shared dynamic stub into a specific slot. Out-of-range
    /// addresses are ignored, matching populate's skip behavior.
    pub fn register_dynamic_stub(&self, guest_addr: u32) {
        if let Some(offset) = self.space.layout().function_slot_offset(guest_addr) {
            let _ = self
                .space
                .write::<u64>(offset, dynamic_stub as GuestFn as usize as u64);
            debug!("Dynamic stub registered at 0x{:08X}", guest_addr);
        }
    }

    /// Look up the host function for an in-range guest address
    pub fn lookup(&self, guest_addr: u32) -> Option<GuestFn> {
        let offset = self.space.layout().function_slot_offset(guest_addr)?;
        let raw = self.space.read::<u64>(offset).ok()?;
        if raw == 0 {
            return None;
        }
        // Safety: slots are only ever written by populate and
        // register_dynamic_stub, both from valid `GuestFn` values.
        Some(unsafe { std::mem::transmute::<usize, GuestFn>(raw as usize) })
    }
}
