//! Indirect call dispatch for the oxidized-xenon substrate
//!
//! Recompiled code reaches host functions through a dense guest-address
//! indexed table; targets the static analysis could not see (function
//! pointers, virtual calls, import thunks) are resolved here at runtime
//! with a logged, zero-result fallback for everything unresolvable.

pub mod context;
pub mod resolver;
pub mod table;

pub use context::CallContext;
pub use resolver::{Dispatcher, FallbackReason, Resolution};
pub use table::{dynamic_stub_calls, FunctionMapping, FunctionTable, GuestFn};
