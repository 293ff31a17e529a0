//! Indirect call resolution
//!
//! Every indirect branch in recompiled code lands here with a
//! runtime-computed guest target. Resolution is a pure decision
//! (`resolve`) separated from invocation and logging (`dispatch`): the
//! decision either names a host function or a fallback reason, and the
//! dispatcher guarantees that every path ends in an invocation or a
//! zeroed r3 with execution continuing at the return address.

use std::sync::Arc;

use ox_core::diag::{DiagnosticCounters, WarnCategory};
use ox_memory::AddressSpace;
use tracing::warn;

use crate::context::CallContext;
use crate::table::{FunctionTable, GuestFn};

/// Primary opcode of `lis` (addis), the first word of an import thunk
const OPCODE_ADDIS: u32 = 15;
/// Primary opcode of `lwz`, the second word of an import thunk
const OPCODE_LWZ: u32 = 32;

/// Outcome of resolving one indirect call target
pub enum Resolution {
    /// Invoke this host function with the caller's context
    Invoke(GuestFn),
    /// No function; set r3 to zero and continue at the return address
    Fallback(FallbackReason),
}

/// Why a target could not be resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// The computed target was zero
    NullTarget,
    /// Outside the code range with no decodable import thunk
    OutOfRange { target: u32 },
    /// Thunk decoded cleanly but the true target has no function
    ThunkUnresolved { target: u32, decoded: u32 },
    /// Inside the code range but the slot is null
    NotRegistered { target: u32 },
}

impl FallbackReason {
    pub fn category(&self) -> WarnCategory {
        match self {
            Self::NullTarget => WarnCategory::NullCall,
            Self::OutOfRange { .. } => WarnCategory::OutOfRangeCall,
            Self::ThunkUnresolved { .. } => WarnCategory::ThunkUnresolved,
            Self::NotRegistered { .. } => WarnCategory::UnresolvedCall,
        }
    }
}

/// Resolves indirect call targets against the function table
pub struct Dispatcher {
    table: Arc<FunctionTable>,
    space: Arc<AddressSpace>,
    diag: Arc<DiagnosticCounters>,
}

impl Dispatcher {
    pub fn new(
        table: Arc<FunctionTable>,
        space: Arc<AddressSpace>,
        diag: Arc<DiagnosticCounters>,
    ) -> Self {
        Self { table, space, diag }
    }

    /// Decide how to reach a host function for `target`. Pure: no
    /// logging, no register mutation, no invocation.
    pub fn resolve(&self, target: u32) -> Resolution {
        if target == 0 {
            return Resolution::Fallback(FallbackReason::NullTarget);
        }

        let layout = self.space.layout();

        if layout.contains_code(target) {
            return match self.table.lookup(target) {
                Some(func) => Resolution::Invoke(func),
                None => Resolution::Fallback(FallbackReason::NotRegistered { target }),
            };
        }

        if layout.is_thunk_candidate(target) {
            match self.decode_import_thunk(target) {
                Some(decoded) => {
                    if layout.contains_code(decoded) {
                        if let Some(func) = self.table.lookup(decoded) {
                            return Resolution::Invoke(func);
                        }
                    }
                    return Resolution::Fallback(FallbackReason::ThunkUnresolved {
                        target,
                        decoded,
                    });
                }
                None => return Resolution::Fallback(FallbackReason::OutOfRange { target }),
            }
        }

        Resolution::Fallback(FallbackReason::OutOfRange { target })
    }

    /// Decode the fixed-shape import stub the original linker leaves for
    /// externally imported functions:
    ///
    /// ```text
    /// lis   r11, IAT@ha
    /// lwz   r11, IAT@l(r11)
    /// mtctr r11
    /// bctr
    /// ```
    ///
    /// The stub is decoded from guest memory, never executed: the two
    /// halves form the import-address-table pointer, and the word behind
    /// it is the true call target. Words that do not carry the expected
    /// opcodes are rejected rather than decoded into a wrong address.
    fn decode_import_thunk(&self, target: u32) -> Option<u32> {
        let w0 = self.space.read_be32(target as u64).ok()?;
        let w1 = self.space.read_be32(target as u64 + 4).ok()?;

        if w0 >> 26 != OPCODE_ADDIS || w1 >> 26 != OPCODE_LWZ {
            return None;
        }

        let hi = (w0 & 0xFFFF) << 16;
        let lo = (w1 & 0xFFFF) as u16 as i16 as i32;
        let iat = (hi as i32).wrapping_add(lo) as u32;

        self.space.read_be32(iat as u64).ok()
    }

    /// Resolve and act: invoke the host function, or log the rate-limited
    /// diagnostic and substitute a zero result. Never panics, never
    /// leaves the call unresolved.
    pub fn dispatch(&self, target: u32, ctx: &mut CallContext) {
        match self.resolve(target) {
            Resolution::Invoke(func) => func(ctx, &self.space),
            Resolution::Fallback(reason) => {
                self.log_fallback(&reason, ctx);
                ctx.set_r3(0);
            }
        }
    }

    fn log_fallback(&self, reason: &FallbackReason, ctx: &CallContext) {
        let cat = reason.category();
        let Some(n) = self.diag.note(cat) else { return };
        let cap = cat.cap();

        match *reason {
            FallbackReason::NullTarget => warn!(
                "[{}] Indirect call to NULL (LR=0x{:08X}) -- skipping ({}/{})",
                cat.tag(),
                ctx.lr as u32,
                n,
                cap
            ),
            FallbackReason::OutOfRange { target } => warn!(
                "[{}] Indirect call to 0x{:08X} outside code range -- LR=0x{:08X}, CTR=0x{:08X} ({}/{})",
                cat.tag(),
                target,
                ctx.lr as u32,
                ctx.ctr as u32,
                n,
                cap
            ),
            FallbackReason::ThunkUnresolved { target, decoded } => warn!(
                "[{}] Import thunk at 0x{:08X} resolves to 0x{:08X} with no function -- LR=0x{:08X} ({}/{})",
                cat.tag(),
                target,
                decoded,
                ctx.lr as u32,
                n,
                cap
            ),
            FallbackReason::NotRegistered { target } => warn!(
                "[{}] Indirect call to 0x{:08X}: no recompiled function -- LR=0x{:08X} ({}/{})",
                cat.tag(),
                target,
                ctx.lr as u32,
                n,
                cap
            ),
        }
    }
}
