//! Raw stderr output for fault-handler context
//!
//! Observers run on the faulting thread; the tracing subscriber may
//! allocate or take locks there, so diagnostic lines from handlers go
//! straight to the stderr file descriptor through `fmt::Write`, which
//! formats on the stack.

use std::fmt;

pub struct RawStderr;

impl fmt::Write for RawStderr {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        #[cfg(unix)]
        unsafe {
            libc::write(2, s.as_ptr() as *const libc::c_void, s.len());
        }

        #[cfg(windows)]
        unsafe {
            use windows_sys::Win32::System::Console::{GetStdHandle, STD_ERROR_HANDLE};
            use windows_sys::Win32::Storage::FileSystem::WriteFile;
            let handle = GetStdHandle(STD_ERROR_HANDLE);
            let mut written = 0u32;
            WriteFile(
                handle,
                s.as_ptr(),
                s.len() as u32,
                &mut written,
                std::ptr::null_mut(),
            );
        }

        Ok(())
    }
}

/// Write one formatted line to stderr without heap allocation
macro_rules! raw_log {
    ($($arg:tt)*) => {{
        use ::std::fmt::Write as _;
        let _ = writeln!($crate::stderr::RawStderr, $($arg)*);
    }};
}

pub(crate) use raw_log;
