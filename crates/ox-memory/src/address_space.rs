//! Flat guest address space
//!
//! One reservation covers the virtual 4 GiB, the physical mirror, and
//! the alias gap. Pages must not consume physical memory until touched:
//! on unix the mapping is `MAP_NORESERVE` and the kernel commits on
//! first touch; on windows the range is only reserved and the statically
//! known regions are committed up front, with everything else committed
//! on demand by the fault observer.

use std::sync::Arc;

use ox_core::error::MemoryError;
use tracing::info;

use crate::layout::{page_align_down, GuestLayout, PAGE_SIZE};

/// The guest address space reservation
///
/// Owns all guest memory for the lifetime of the runtime. Sub-regions
/// are offsets into this one block; see [`GuestLayout`].
pub struct AddressSpace {
    base: *mut u8,
    layout: GuestLayout,
}

// Safety: the mapping is process-wide and all mutation goes through raw
// pointer writes that the guest's own memory model already allows to race.
unsafe impl Send for AddressSpace {}
unsafe impl Sync for AddressSpace {}

impl AddressSpace {
    /// Reserve the guest address space with the default layout
    pub fn reserve() -> Result<Arc<Self>, MemoryError> {
        Self::reserve_with(GuestLayout::default())
    }

    /// Reserve the guest address space for a specific layout
    pub fn reserve_with(layout: GuestLayout) -> Result<Arc<Self>, MemoryError> {
        let base = Self::reserve_host_range(layout.reservation_size())?;
        let space = Self { base, layout };

        #[cfg(windows)]
        space.commit_static_regions()?;

        info!(
            "Guest address space reserved at {:p} ({} GiB)",
            base,
            layout.reservation_size() >> 30
        );
        for region in layout.regions() {
            info!(
                "  {:<8} 0x{:08X} - 0x{:08X}",
                region.name,
                region.base,
                region.end()
            );
        }
        info!(
            "  {:<8} 0x{:08X} - 0x{:08X}",
            "FnTable",
            layout.function_table_offset(),
            layout.function_table_offset() + layout.function_table_size()
        );

        Ok(Arc::new(space))
    }

    #[cfg(unix)]
    fn reserve_host_range(size: usize) -> Result<*mut u8, MemoryError> {
        use libc::{
            mmap, MAP_ANONYMOUS, MAP_FAILED, MAP_NORESERVE, MAP_PRIVATE, PROT_READ, PROT_WRITE,
        };

        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS | MAP_NORESERVE,
                -1,
                0,
            )
        };

        if ptr == MAP_FAILED {
            let code = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err(MemoryError::ReservationFailed { code });
        }

        Ok(ptr as *mut u8)
    }

    #[cfg(windows)]
    fn reserve_host_range(size: usize) -> Result<*mut u8, MemoryError> {
        use windows_sys::Win32::System::Memory::{VirtualAlloc, MEM_RESERVE, PAGE_READWRITE};

        let ptr = unsafe { VirtualAlloc(std::ptr::null(), size, MEM_RESERVE, PAGE_READWRITE) };

        if ptr.is_null() {
            let code = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err(MemoryError::ReservationFailed { code });
        }

        Ok(ptr as *mut u8)
    }

    /// Commit the regions guest code touches before the fault observer is
    /// installed: image, function table, stack, kernel objects, heap.
    #[cfg(windows)]
    fn commit_static_regions(&self) -> Result<(), MemoryError> {
        for region in self.layout.regions() {
            self.commit_range(region.base as u64, region.size as u64)?;
        }
        self.commit_range(
            self.layout.function_table_offset(),
            self.layout.function_table_size(),
        )?;
        Ok(())
    }

    #[cfg(windows)]
    fn commit_range(&self, offset: u64, len: u64) -> Result<(), MemoryError> {
        let start = page_align_down(offset);
        let end = crate::layout::page_align_up(offset + len);
        let mut page = start;
        while page < end {
            self.commit_host_page(self.base as u64 + page)?;
            page += PAGE_SIZE;
        }
        Ok(())
    }

    /// Host base pointer of the reservation
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn layout(&self) -> &GuestLayout {
        &self.layout
    }

    /// Whether a host address falls inside the guest's span (virtual
    /// space plus physical mirror).
    pub fn contains_host(&self, host_addr: u64) -> bool {
        let base = self.base as u64;
        host_addr >= base && host_addr < base + crate::layout::GUEST_SPAN
    }

    fn checked_offset(&self, addr: u64, len: usize) -> Result<u64, MemoryError> {
        if addr >= crate::layout::GUEST_SPAN {
            return Err(MemoryError::OutOfBounds { addr, len });
        }
        let offset = self.layout.host_offset(addr);
        let end = offset
            .checked_add(len as u64)
            .ok_or(MemoryError::OutOfBounds { addr, len })?;
        if end > self.layout.reservation_size() as u64 {
            return Err(MemoryError::OutOfBounds { addr, len });
        }
        Ok(offset)
    }

    /// Get raw pointer for a guest address (unchecked, for hot paths)
    ///
    /// # Safety
    /// Caller must ensure the address is within the reservation.
    #[inline(always)]
    pub unsafe fn ptr(&self, addr: u64) -> *mut u8 {
        self.base.add(self.layout.host_offset(addr) as usize)
    }

    /// Read a value from guest memory
    #[inline]
    pub fn read<T: Copy>(&self, addr: u64) -> Result<T, MemoryError> {
        self.checked_offset(addr, std::mem::size_of::<T>())?;
        Ok(unsafe { self.read_unchecked(addr) })
    }

    /// Read without bounds checking (for hot paths after validation)
    ///
    /// # Safety
    /// Caller must ensure the address is within the reservation.
    #[inline(always)]
    pub unsafe fn read_unchecked<T: Copy>(&self, addr: u64) -> T {
        std::ptr::read_unaligned(self.ptr(addr) as *const T)
    }

    /// Write a value to guest memory
    #[inline]
    pub fn write<T: Copy>(&self, addr: u64, value: T) -> Result<(), MemoryError> {
        self.checked_offset(addr, std::mem::size_of::<T>())?;
        unsafe { self.write_unchecked(addr, value) };
        Ok(())
    }

    /// Write without bounds checking (for hot paths after validation)
    ///
    /// # Safety
    /// Caller must ensure the address is within the reservation.
    #[inline(always)]
    pub unsafe fn write_unchecked<T: Copy>(&self, addr: u64, value: T) {
        std::ptr::write_unaligned(self.ptr(addr) as *mut T, value);
    }

    /// Read a big-endian u16 (the guest is big-endian)
    #[inline]
    pub fn read_be16(&self, addr: u64) -> Result<u16, MemoryError> {
        let value: u16 = self.read(addr)?;
        Ok(u16::from_be(value))
    }

    /// Write a big-endian u16
    #[inline]
    pub fn write_be16(&self, addr: u64, value: u16) -> Result<(), MemoryError> {
        self.write(addr, value.to_be())
    }

    /// Read a big-endian u32
    #[inline]
    pub fn read_be32(&self, addr: u64) -> Result<u32, MemoryError> {
        let value: u32 = self.read(addr)?;
        Ok(u32::from_be(value))
    }

    /// Write a big-endian u32
    #[inline]
    pub fn write_be32(&self, addr: u64, value: u32) -> Result<(), MemoryError> {
        self.write(addr, value.to_be())
    }

    /// Read a big-endian u64
    #[inline]
    pub fn read_be64(&self, addr: u64) -> Result<u64, MemoryError> {
        let value: u64 = self.read(addr)?;
        Ok(u64::from_be(value))
    }

    /// Write a big-endian u64
    #[inline]
    pub fn write_be64(&self, addr: u64, value: u64) -> Result<(), MemoryError> {
        self.write(addr, value.to_be())
    }

    /// Copy data into guest memory
    pub fn write_bytes(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        let offset = self.checked_offset(addr, data.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.base.add(offset as usize),
                data.len(),
            );
        }
        Ok(())
    }

    /// Copy data out of guest memory
    pub fn read_bytes(&self, addr: u64, size: usize) -> Result<Vec<u8>, MemoryError> {
        let offset = self.checked_offset(addr, size)?;
        let mut data = vec![0u8; size];
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base.add(offset as usize),
                data.as_mut_ptr(),
                size,
            );
        }
        Ok(data)
    }

    /// Commit the page containing a host address with read/write access.
    /// Returns the page-aligned host address that was committed.
    pub fn commit_host_page(&self, host_addr: u64) -> Result<u64, MemoryError> {
        let page = page_align_down(host_addr);

        #[cfg(unix)]
        {
            use libc::{mprotect, PROT_READ, PROT_WRITE};
            let rc = unsafe {
                mprotect(
                    page as *mut libc::c_void,
                    PAGE_SIZE as usize,
                    PROT_READ | PROT_WRITE,
                )
            };
            if rc != 0 {
                let code = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                return Err(MemoryError::CommitFailed { addr: page, code });
            }
        }

        #[cfg(windows)]
        {
            use windows_sys::Win32::System::Memory::{VirtualAlloc, MEM_COMMIT, PAGE_READWRITE};
            let ptr = unsafe {
                VirtualAlloc(
                    page as *const std::ffi::c_void,
                    PAGE_SIZE as usize,
                    MEM_COMMIT,
                    PAGE_READWRITE,
                )
            };
            if ptr.is_null() {
                let code = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                return Err(MemoryError::CommitFailed { addr: page, code });
            }
        }

        Ok(page)
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        if self.base.is_null() {
            return;
        }

        #[cfg(unix)]
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.layout.reservation_size());
        }

        #[cfg(windows)]
        unsafe {
            use windows_sys::Win32::System::Memory::{VirtualFree, MEM_RELEASE};
            VirtualFree(self.base as *mut _, 0, MEM_RELEASE);
        }

        self.base = std::ptr::null_mut();
    }
}
