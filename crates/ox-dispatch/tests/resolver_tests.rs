//! Resolution properties for indirect call dispatch

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ox_core::diag::{DiagnosticCounters, WarnCategory};
use ox_dispatch::{CallContext, Dispatcher, FallbackReason, FunctionMapping, FunctionTable, Resolution};
use ox_memory::{AddressSpace, GuestLayout};

static FN_A_CALLS: AtomicU64 = AtomicU64::new(0);
static FN_B_CALLS: AtomicU64 = AtomicU64::new(0);

fn fn_a(ctx: &mut CallContext, _space: &AddressSpace) {
    FN_A_CALLS.fetch_add(1, Ordering::Relaxed);
    ctx.set_r3(0xAAAA);
}

fn fn_b(ctx: &mut CallContext, _space: &AddressSpace) {
    FN_B_CALLS.fetch_add(1, Ordering::Relaxed);
    ctx.set_r3(0xBBBB);
}

struct Fixture {
    dispatcher: Dispatcher,
    space: Arc<AddressSpace>,
    diag: Arc<DiagnosticCounters>,
}

fn fixture(mappings: &[FunctionMapping]) -> Fixture {
    let space = AddressSpace::reserve().unwrap();
    let table = Arc::new(FunctionTable::new(space.clone()));
    table.populate(mappings);
    let diag = Arc::new(DiagnosticCounters::new());
    let dispatcher = Dispatcher::new(table, space.clone(), diag.clone());
    Fixture {
        dispatcher,
        space,
        diag,
    }
}

/// Write a linker-shaped import thunk at `thunk` whose IAT word at `iat`
/// holds `true_target`.
fn write_thunk(space: &AddressSpace, thunk: u32, iat: u32, true_target: u32) {
    let hi = (iat >> 16) + u32::from(iat & 0x8000 != 0);
    let lo = iat & 0xFFFF;
    // lis r11, hi ; lwz r11, lo(r11)
    space
        .write_be32(thunk as u64, (15 << 26) | (11 << 21) | (hi & 0xFFFF))
        .unwrap();
    space
        .write_be32(thunk as u64 + 4, (32 << 26) | (11 << 21) | (11 << 16) | lo)
        .unwrap();
    space.write_be32(iat as u64, true_target).unwrap();
}

#[test]
fn test_registered_target_invoked_with_context_intact() {
    let code_base = GuestLayout::default().code_base;
    let f = fixture(&[FunctionMapping::new(code_base, fn_a), FunctionMapping::END]);

    let mut ctx = CallContext::new();
    ctx.lr = 0x8210_1234;
    ctx.ctr = code_base as u64;
    ctx.gpr[5] = 77;

    let before = FN_A_CALLS.load(Ordering::Relaxed);
    f.dispatcher.dispatch(code_base, &mut ctx);

    assert_eq!(FN_A_CALLS.load(Ordering::Relaxed), before + 1);
    assert_eq!(ctx.r3(), 0xAAAA);
    // Untouched registers survive the call
    assert_eq!(ctx.gpr[5], 77);
    assert_eq!(ctx.lr, 0x8210_1234);
}

#[test]
fn test_null_target_falls_back_and_counts_once() {
    let f = fixture(&[FunctionMapping::END]);

    let mut ctx = CallContext::new();
    ctx.set_r3(0xDEAD);
    f.dispatcher.dispatch(0, &mut ctx);

    assert_eq!(ctx.r3(), 0);
    assert_eq!(f.diag.occurrences(WarnCategory::NullCall), 1);
    assert_eq!(f.diag.emitted(WarnCategory::NullCall), 1);
}

#[test]
fn test_out_of_range_never_invokes() {
    let f = fixture(&[FunctionMapping::END]);
    let layout = *f.space.layout();

    let before = FN_A_CALLS.load(Ordering::Relaxed) + FN_B_CALLS.load(Ordering::Relaxed);

    // Heap, stack, above-4GiB-wrap, and just past the code range: none of
    // these may reach a host function, and r3 always ends up zero.
    let targets = [
        layout.heap_base,
        layout.stack_top - 8,
        0xF000_0000,
        (layout.code_base as u64 + layout.code_size as u64) as u32,
    ];
    for target in targets {
        let mut ctx = CallContext::new();
        ctx.set_r3(0x1234_5678);
        f.dispatcher.dispatch(target, &mut ctx);
        assert_eq!(ctx.r3(), 0, "target 0x{target:08X} must fall back");
    }

    assert_eq!(
        FN_A_CALLS.load(Ordering::Relaxed) + FN_B_CALLS.load(Ordering::Relaxed),
        before
    );
    assert_eq!(f.diag.occurrences(WarnCategory::OutOfRangeCall), 4);
}

#[test]
fn test_unregistered_in_range_target_falls_back() {
    let f = fixture(&[FunctionMapping::END]);
    let code_base = f.space.layout().code_base;

    let mut ctx = CallContext::new();
    ctx.set_r3(0xFFFF);
    f.dispatcher.dispatch(code_base + 0x40, &mut ctx);

    assert_eq!(ctx.r3(), 0);
    assert_eq!(f.diag.occurrences(WarnCategory::UnresolvedCall), 1);
}

#[test]
fn test_thunk_dispatch_matches_direct_dispatch() {
    let code_base = GuestLayout::default().code_base;
    let f = fixture(&[FunctionMapping::new(code_base + 0x20, fn_b), FunctionMapping::END]);
    let layout = *f.space.layout();

    let thunk = layout.image_base + 0x1000;
    let iat = layout.image_base + 0x2000;
    write_thunk(&f.space, thunk, iat, code_base + 0x20);

    let before = FN_B_CALLS.load(Ordering::Relaxed);

    let mut direct_ctx = CallContext::new();
    f.dispatcher.dispatch(code_base + 0x20, &mut direct_ctx);

    let mut thunk_ctx = CallContext::new();
    f.dispatcher.dispatch(thunk, &mut thunk_ctx);

    assert_eq!(FN_B_CALLS.load(Ordering::Relaxed), before + 2);
    assert_eq!(direct_ctx.r3(), thunk_ctx.r3());
    assert_eq!(f.diag.occurrences(WarnCategory::ThunkUnresolved), 0);
}

#[test]
fn test_thunk_with_negative_low_half() {
    // lwz displacements are sign-extended; an IAT in the lower half of a
    // 64 KiB block exercises the @ha carry.
    let code_base = GuestLayout::default().code_base;
    let f = fixture(&[FunctionMapping::new(code_base, fn_a), FunctionMapping::END]);
    let layout = *f.space.layout();

    let thunk = layout.image_base + 0x1100;
    let iat = layout.image_base + 0xF000; // low half 0xF000 is negative
    write_thunk(&f.space, thunk, iat, code_base);

    match f.dispatcher.resolve(thunk) {
        Resolution::Invoke(_) => {}
        Resolution::Fallback(reason) => panic!("expected invoke, got {reason:?}"),
    }
}

#[test]
fn test_thunk_with_unresolvable_iat_target_falls_back() {
    let f = fixture(&[FunctionMapping::END]);
    let layout = *f.space.layout();

    let thunk = layout.image_base + 0x1200;
    let iat = layout.image_base + 0x2200;
    // True target lands in the heap: decodes fine, resolves to nothing
    write_thunk(&f.space, thunk, iat, layout.heap_base);

    let mut ctx = CallContext::new();
    ctx.set_r3(0x7777);
    f.dispatcher.dispatch(thunk, &mut ctx);

    assert_eq!(ctx.r3(), 0);
    assert_eq!(f.diag.occurrences(WarnCategory::ThunkUnresolved), 1);
}

#[test]
fn test_malformed_thunk_rejected_by_shape_check() {
    let f = fixture(&[FunctionMapping::END]);
    let layout = *f.space.layout();

    // Plausible-looking words that are not lis/lwz
    let not_thunk = layout.image_base + 0x1300;
    f.space.write_be32(not_thunk as u64, 0x7D69_03A6).unwrap(); // mtctr r11
    f.space.write_be32(not_thunk as u64 + 4, 0x4E80_0420).unwrap(); // bctr

    match f.dispatcher.resolve(not_thunk) {
        Resolution::Fallback(FallbackReason::OutOfRange { target }) => {
            assert_eq!(target, not_thunk)
        }
        Resolution::Fallback(reason) => panic!("wrong reason {reason:?}"),
        Resolution::Invoke(_) => panic!("malformed thunk must not resolve"),
    }
}

#[test]
fn test_mappings_below_code_range_populate_nothing_but_resolve_safely() {
    // Scenario from the original linker output: both addresses sit below
    // code_base, so population skips them, and resolving them goes
    // through the thunk path or falls back without crashing.
    let f = {
        let space = AddressSpace::reserve().unwrap();
        let table = Arc::new(FunctionTable::new(space.clone()));
        let populated = table.populate(&[
            FunctionMapping::new(0x8201_0000, fn_a),
            FunctionMapping::new(0x8202_0000, fn_b),
            FunctionMapping::END,
        ]);
        assert_eq!(populated, 0);
        let diag = Arc::new(DiagnosticCounters::new());
        Fixture {
            dispatcher: Dispatcher::new(table, space.clone(), diag.clone()),
            space,
            diag,
        }
    };

    for target in [0x8201_0000u32, 0x8202_0000] {
        let mut ctx = CallContext::new();
        ctx.set_r3(0x5555);
        f.dispatcher.dispatch(target, &mut ctx);
        assert_eq!(ctx.r3(), 0);
    }
    assert_eq!(f.diag.occurrences(WarnCategory::OutOfRangeCall), 2);
}

#[test]
fn test_rate_limit_holds_under_storm() {
    let f = fixture(&[FunctionMapping::END]);
    let cap = WarnCategory::NullCall.cap();

    // 10x the cap, as a hot loop with a persistently bad pointer would
    for _ in 0..cap * 10 {
        let mut ctx = CallContext::new();
        f.dispatcher.dispatch(0, &mut ctx);
    }

    assert_eq!(f.diag.occurrences(WarnCategory::NullCall), cap * 10);
    assert_eq!(f.diag.emitted(WarnCategory::NullCall), cap);

    // An unrelated category is still unthrottled
    assert_eq!(f.diag.emitted(WarnCategory::OutOfRangeCall), 0);
}

#[test]
fn test_dynamic_stub_reachable_through_dispatch() {
    let f = fixture(&[FunctionMapping::END]);
    let stub_addr = f.space.layout().dynamic_stub_addr();

    let before = ox_dispatch::dynamic_stub_calls();
    let mut ctx = CallContext::new();
    ctx.set_r3(0x9999);
    f.dispatcher.dispatch(stub_addr, &mut ctx);

    assert_eq!(ctx.r3(), 0);
    assert_eq!(ox_dispatch::dynamic_stub_calls(), before + 1);
    // The stub is an ordinary invocation, not a resolver fallback
    assert_eq!(f.diag.occurrences(WarnCategory::UnresolvedCall), 0);
}
