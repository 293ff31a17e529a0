//! OS fault delivery
//!
//! Adapts the platform's hardware-exception mechanism (POSIX signals,
//! Windows vectored exception handling) to the portable observer chain.
//! The OS hands faults to a process-global handler, so the chain is
//! installed into a process-wide slot exactly once.

use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};

use ox_core::error::FaultError;

use crate::observer::{FaultChain, FaultDisposition, FaultInfo};

static CHAIN: OnceCell<FaultChain> = OnceCell::new();
static INSTALLED: AtomicBool = AtomicBool::new(false);
static ACTIVE: AtomicBool = AtomicBool::new(false);

/// Keeps the OS handler registered; dropping it unhooks delivery.
///
/// The chain itself stays in the process-wide slot, so a process gets
/// one installation for its lifetime.
pub struct FaultHandlerGuard {
    #[cfg(unix)]
    previous: [(i32, libc::sigaction); 2],
    #[cfg(windows)]
    handle: *mut std::ffi::c_void,
}

// Safety: the guard only holds restoration state; unhooking from any
// thread is supported by both platforms.
unsafe impl Send for FaultHandlerGuard {}

/// Install the observer chain as the process fault handler
///
/// Fails with [`FaultError::AlreadyInstalled`] on any second call after a
/// successful install, even once the first guard was dropped. A failed
/// registration leaves the slot free for a retry.
pub fn install(chain: FaultChain) -> Result<FaultHandlerGuard, FaultError> {
    install_with(chain, register_host_handler)
}

fn install_with(
    chain: FaultChain,
    register: impl FnOnce() -> Result<FaultHandlerGuard, FaultError>,
) -> Result<FaultHandlerGuard, FaultError> {
    if INSTALLED
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Err(FaultError::AlreadyInstalled);
    }

    let guard = match register() {
        Ok(guard) => guard,
        Err(err) => {
            INSTALLED.store(false, Ordering::Release);
            return Err(err);
        }
    };

    // Only the single winner of the gate above reaches this point, and
    // failed attempts never get here, so the slot is still empty.
    let _ = CHAIN.set(chain);
    ACTIVE.store(true, Ordering::Release);
    tracing::info!("Fault handlers installed");
    Ok(guard)
}

fn dispatch(fault: &FaultInfo) -> FaultDisposition {
    if !ACTIVE.load(Ordering::Acquire) {
        return FaultDisposition::Decline;
    }
    match CHAIN.get() {
        Some(chain) => chain.dispatch(fault),
        None => FaultDisposition::Decline,
    }
}

impl Drop for FaultHandlerGuard {
    fn drop(&mut self) {
        ACTIVE.store(false, Ordering::Release);

        #[cfg(unix)]
        unsafe {
            for (signal, previous) in &self.previous {
                libc::sigaction(*signal, previous, std::ptr::null_mut());
            }
        }

        #[cfg(windows)]
        unsafe {
            use windows_sys::Win32::System::Diagnostics::Debug::RemoveVectoredExceptionHandler;
            RemoveVectoredExceptionHandler(self.handle);
        }
    }
}

#[cfg(unix)]
fn register_host_handler() -> Result<FaultHandlerGuard, FaultError> {
    use ox_core::error::AccessKind;

    extern "C" fn on_signal(
        signal: libc::c_int,
        info: *mut libc::siginfo_t,
        context: *mut libc::c_void,
    ) {
        let addr = unsafe { (*info).si_addr() } as u64;
        let (host, kind) = host_context(context);

        let fault = FaultInfo {
            code: signal as u32,
            addr,
            kind,
            host,
        };

        if dispatch(&fault) == FaultDisposition::Resume {
            return;
        }

        // Nobody repaired it. Drop back to the default action so the
        // re-executed instruction terminates the process with a core.
        unsafe {
            let mut dfl: libc::sigaction = std::mem::zeroed();
            dfl.sa_sigaction = libc::SIG_DFL;
            libc::sigaction(signal, &dfl, std::ptr::null_mut());
        }
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    fn host_context(context: *mut libc::c_void) -> (crate::observer::HostContext, AccessKind) {
        let uc = unsafe { &*(context as *const libc::ucontext_t) };
        let gregs = &uc.uc_mcontext.gregs;
        let reg = |r: i32| gregs[r as usize] as u64;

        let host = crate::observer::HostContext {
            ip: reg(libc::REG_RIP),
            sp: reg(libc::REG_RSP),
            gpr: [
                reg(libc::REG_RAX),
                reg(libc::REG_RBX),
                reg(libc::REG_RCX),
                reg(libc::REG_RDX),
                reg(libc::REG_RSI),
                reg(libc::REG_RDI),
                reg(libc::REG_RBP),
                reg(libc::REG_RSP),
                reg(libc::REG_R8),
                reg(libc::REG_R9),
                reg(libc::REG_R10),
                reg(libc::REG_R11),
                reg(libc::REG_R12),
                reg(libc::REG_R13),
                reg(libc::REG_R14),
                reg(libc::REG_R15),
            ],
        };

        // Page-fault error code bit 1: set for writes
        let kind = if reg(libc::REG_ERR) & 0x2 != 0 {
            AccessKind::Write
        } else {
            AccessKind::Read
        };
        (host, kind)
    }

    #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
    fn host_context(_context: *mut libc::c_void) -> (crate::observer::HostContext, AccessKind) {
        (crate::observer::HostContext::default(), AccessKind::Read)
    }

    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = on_signal as usize;
    action.sa_flags = libc::SA_SIGINFO;
    unsafe { libc::sigemptyset(&mut action.sa_mask) };

    let mut previous: [(i32, libc::sigaction); 2] = unsafe { std::mem::zeroed() };
    for (i, signal) in [libc::SIGSEGV, libc::SIGBUS].into_iter().enumerate() {
        previous[i].0 = signal;
        let rc = unsafe { libc::sigaction(signal, &action, &mut previous[i].1) };
        if rc != 0 {
            let code = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err(FaultError::RegistrationFailed { code });
        }
    }

    Ok(FaultHandlerGuard { previous })
}

#[cfg(windows)]
fn register_host_handler() -> Result<FaultHandlerGuard, FaultError> {
    use ox_core::error::AccessKind;
    use windows_sys::Win32::System::Diagnostics::Debug::{
        AddVectoredExceptionHandler, EXCEPTION_POINTERS,
    };

    const EXCEPTION_BREAKPOINT: u32 = 0x8000_0003;
    const EXCEPTION_SINGLE_STEP: u32 = 0x8000_0004;
    // Debugger thread-naming convention, raised deliberately
    const SET_THREAD_NAME: u32 = 0x406D_1388;
    const EXCEPTION_CONTINUE_EXECUTION: i32 = -1;
    const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

    unsafe extern "system" fn on_exception(pointers: *mut EXCEPTION_POINTERS) -> i32 {
        let record = unsafe { &*(*pointers).ExceptionRecord };
        let code = record.ExceptionCode as u32;

        if code == EXCEPTION_BREAKPOINT || code == EXCEPTION_SINGLE_STEP || code == SET_THREAD_NAME
        {
            return EXCEPTION_CONTINUE_SEARCH;
        }

        let (addr, kind) = if record.NumberParameters >= 2 {
            let kind = match record.ExceptionInformation[0] {
                1 => AccessKind::Write,
                8 => AccessKind::Execute,
                _ => AccessKind::Read,
            };
            (record.ExceptionInformation[1] as u64, kind)
        } else {
            (0, AccessKind::Read)
        };

        let context = unsafe { &*(*pointers).ContextRecord };
        let host = crate::observer::HostContext {
            ip: context.Rip,
            sp: context.Rsp,
            gpr: [
                context.Rax, context.Rbx, context.Rcx, context.Rdx, context.Rsi, context.Rdi,
                context.Rbp, context.Rsp, context.R8, context.R9, context.R10, context.R11,
                context.R12, context.R13, context.R14, context.R15,
            ],
        };

        let fault = FaultInfo { code, addr, kind, host };

        if dispatch(&fault) == FaultDisposition::Resume {
            EXCEPTION_CONTINUE_EXECUTION
        } else {
            EXCEPTION_CONTINUE_SEARCH
        }
    }

    // Last position: debugger and runtime handlers see faults first.
    let handle = unsafe { AddVectoredExceptionHandler(0, Some(on_exception)) };
    if handle.is_null() {
        let code = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        return Err(FaultError::RegistrationFailed { code });
    }

    Ok(FaultHandlerGuard { handle })
}
