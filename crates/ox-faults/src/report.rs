//! Crash reporting
//!
//! Last observer in the chain. By the time a fault reaches it nothing
//! repaired the access, so it prints an exception block to raw stderr
//! and declines, letting the platform default take the process down
//! with the diagnostics already flushed.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::observer::{FaultDisposition, FaultInfo, FaultObserver, GPR_NAMES};
use crate::stderr::raw_log;

/// Upper bound on a module's mapped span when guessing whether a stack
/// value is a return address.
const MODULE_SPAN_GUESS: u64 = 0x1000_0000;

/// Prints unhandled faults and declines them
pub struct CrashReporter {
    stack_depth: usize,
    occurrences: AtomicU64,
}

impl CrashReporter {
    /// Chain priority. Runs after every repairing observer.
    pub const PRIORITY: i32 = i32::MIN;

    pub fn new(stack_depth: usize) -> Self {
        Self {
            stack_depth,
            occurrences: AtomicU64::new(0),
        }
    }

    /// How many faults have reached the reporter
    pub fn occurrences(&self) -> u64 {
        self.occurrences.load(Ordering::Relaxed)
    }

    fn report(&self, fault: &FaultInfo, nth: u64) {
        let module = host_module_base();
        let host = &fault.host;

        raw_log!("==================== EXCEPTION #{} ====================", nth);
        raw_log!(
            "Code 0x{:08X}: {} access violation at 0x{:016X}",
            fault.code,
            fault.kind,
            fault.addr
        );
        match module {
            Some(base) if host.ip >= base => {
                raw_log!(
                    "IP  0x{:016X} (module base + 0x{:X})",
                    host.ip,
                    host.ip - base
                );
            }
            _ => raw_log!("IP  0x{:016X}", host.ip),
        }

        // One line per 4 registers, formatted on the stack: a fault inside
        // the allocator must still produce a full report.
        for row in 0..4 {
            let i = row * 4;
            raw_log!(
                "{:>4}=0x{:016X} {:>4}=0x{:016X} {:>4}=0x{:016X} {:>4}=0x{:016X}",
                GPR_NAMES[i],
                host.gpr[i],
                GPR_NAMES[i + 1],
                host.gpr[i + 1],
                GPR_NAMES[i + 2],
                host.gpr[i + 2],
                GPR_NAMES[i + 3],
                host.gpr[i + 3]
            );
        }

        self.dump_code_window(host.ip);
        self.dump_stack(host.sp, module);

        raw_log!("=======================================================");
    }

    /// Bytes around the faulting instruction, when the page holding it
    /// is actually mapped.
    fn dump_code_window(&self, ip: u64) {
        if ip == 0 || !is_readable(ip) {
            return;
        }
        let mut bytes = [0u8; 16];
        for (i, slot) in bytes.iter_mut().enumerate() {
            *slot = unsafe { std::ptr::read_volatile((ip + i as u64) as *const u8) };
        }
        raw_log!(
            "Code {:02X} {:02X} {:02X} {:02X} {:02X} {:02X} {:02X} {:02X} \
             {:02X} {:02X} {:02X} {:02X} {:02X} {:02X} {:02X} {:02X}",
            bytes[0],
            bytes[1],
            bytes[2],
            bytes[3],
            bytes[4],
            bytes[5],
            bytes[6],
            bytes[7],
            bytes[8],
            bytes[9],
            bytes[10],
            bytes[11],
            bytes[12],
            bytes[13],
            bytes[14],
            bytes[15]
        );
    }

    fn dump_stack(&self, sp: u64, module: Option<u64>) {
        if sp == 0 || sp % 8 != 0 {
            return;
        }
        raw_log!("Stack:");
        for i in 0..self.stack_depth as u64 {
            let slot = sp + i * 8;
            if !is_readable(slot) {
                break;
            }
            let value = unsafe { std::ptr::read_volatile(slot as *const u64) };
            match module {
                Some(base) if value > base && value < base + MODULE_SPAN_GUESS => {
                    raw_log!(
                        "  [0x{:016X}] 0x{:016X}  <- likely return address (module base + 0x{:X})",
                        slot,
                        value,
                        value - base
                    );
                }
                _ => raw_log!("  [0x{:016X}] 0x{:016X}", slot, value),
            }
        }
    }
}

impl FaultObserver for CrashReporter {
    fn name(&self) -> &'static str {
        "crash-reporter"
    }

    fn on_fault(&self, fault: &FaultInfo) -> FaultDisposition {
        let nth = self.occurrences.fetch_add(1, Ordering::Relaxed) + 1;
        self.report(fault, nth);
        FaultDisposition::Decline
    }
}

/// Base address of the executable image, for module-relative offsets
/// that survive ASLR across runs.
fn host_module_base() -> Option<u64> {
    #[cfg(unix)]
    {
        let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
        let probe = host_module_base as *const ();
        let rc = unsafe { libc::dladdr(probe as *const libc::c_void, &mut info) };
        if rc != 0 && !info.dli_fbase.is_null() {
            return Some(info.dli_fbase as u64);
        }
        None
    }

    #[cfg(windows)]
    {
        use windows_sys::Win32::System::LibraryLoader::{
            GetModuleHandleExA, GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS,
            GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
        };
        let mut module = std::ptr::null_mut();
        let rc = unsafe {
            GetModuleHandleExA(
                GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS
                    | GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
                host_module_base as *const () as *const u8,
                &mut module,
            )
        };
        if rc != 0 && !module.is_null() {
            return Some(module as u64);
        }
        None
    }
}

/// Whether the page holding `addr` is mapped and readable. Probing with
/// a syscall avoids re-faulting inside the handler.
fn is_readable(addr: u64) -> bool {
    if addr == 0 {
        return false;
    }

    #[cfg(unix)]
    {
        let page = addr & !0xFFF;
        let rc = unsafe { libc::msync(page as *mut libc::c_void, 0x1000, libc::MS_ASYNC) };
        rc == 0
    }

    #[cfg(windows)]
    {
        use windows_sys::Win32::System::Memory::{
            VirtualQuery, MEMORY_BASIC_INFORMATION, MEM_COMMIT, PAGE_NOACCESS,
        };
        let mut info: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
        let len = unsafe {
            VirtualQuery(
                addr as *const std::ffi::c_void,
                &mut info,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        len != 0 && info.State == MEM_COMMIT && info.Protect != PAGE_NOACCESS
    }
}
