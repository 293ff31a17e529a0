//! Guest address-space layout
//!
//! All sub-regions are offsets into one flat reservation; nothing here
//! owns memory. The concrete values come from the recompiler's analysis
//! of the original executable and are fixed for a given title.

use bitflags::bitflags;

/// Standard guest page size
pub const PAGE_SIZE: u64 = 0x1000;

/// Size of the guest virtual address space
pub const VIRTUAL_SPAN: u64 = 0x1_0000_0000;

/// Guest addresses at or above this are physical-space accesses,
/// served by the mirror mapped after the virtual 4 GiB.
pub const PHYSICAL_SPACE_BASE: u64 = 0x1_0000_0000;

/// Host offset added to physical-space addresses. The 4 KiB gap keeps
/// linear physical memory clear of the host's MMIO interception window
/// at the start of the mirror.
pub const PHYSICAL_ALIAS_GAP: u64 = 0x1000;

/// Span of host addresses that belong to the guest: virtual 4 GiB plus
/// the physical mirror.
pub const GUEST_SPAN: u64 = 2 * VIRTUAL_SPAN;

bitflags! {
    /// Region attribute flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RegionFlags: u32 {
        /// Region is readable
        const READ       = 0b0001;
        /// Region is writable
        const WRITE      = 0b0010;
        /// Region contains recompiled code entry points
        const EXECUTE    = 0b0100;
        /// Region grows downward from its top
        const GROWS_DOWN = 0b1000;

        /// Read and write access
        const RW  = Self::READ.bits() | Self::WRITE.bits();
        /// Read, write, and execute access
        const RWX = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

/// Named sub-region of the guest address space
#[derive(Debug, Clone, Copy)]
pub struct Region {
    pub base: u32,
    pub size: u32,
    pub flags: RegionFlags,
    pub name: &'static str,
}

impl Region {
    pub fn end(&self) -> u64 {
        self.base as u64 + self.size as u64
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && (addr as u64) < self.end()
    }
}

/// Sub-region layout of the 4 GiB guest space
///
/// Invariants: the code region is a sub-range of the image region, all
/// regions lie within the virtual 4 GiB, and no two regions other than
/// image/code overlap.
#[derive(Debug, Clone, Copy)]
pub struct GuestLayout {
    pub image_base: u32,
    pub image_size: u32,
    pub code_base: u32,
    pub code_size: u32,
    /// Stack top; the stack grows down from here
    pub stack_top: u32,
    pub stack_size: u32,
    pub heap_base: u32,
    pub heap_size: u32,
    /// Guest kernel processor control region
    pub kpcr_base: u32,
    /// Guest kernel thread object
    pub kthread_base: u32,
}

impl Default for GuestLayout {
    fn default() -> Self {
        Self {
            image_base: 0x8200_0000,
            image_size: 0x003E_0000,
            code_base: 0x820A_0000,
            code_size: 0x0023_7350,
            stack_top: 0x9000_0000,
            stack_size: 0x0010_0000,
            heap_base: 0xA000_0000,
            heap_size: 0x1000_0000,
            kpcr_base: 0x9200_0000,
            kthread_base: 0x9200_1000,
        }
    }
}

/// Size of the KPCR and KTHREAD kernel-object regions
pub const KERNEL_OBJECT_SIZE: u32 = 0x1000;

impl GuestLayout {
    /// Total host reservation: both guest spans plus the alias gap
    pub fn reservation_size(&self) -> usize {
        (GUEST_SPAN + PHYSICAL_ALIAS_GAP) as usize
    }

    pub fn contains_code(&self, addr: u32) -> bool {
        addr >= self.code_base && (addr as u64) < self.code_base as u64 + self.code_size as u64
    }

    pub fn contains_image(&self, addr: u32) -> bool {
        addr >= self.image_base && (addr as u64) < self.image_base as u64 + self.image_size as u64
    }

    /// Import thunks live in the image below the recompiled code
    pub fn is_thunk_candidate(&self, addr: u32) -> bool {
        addr >= self.image_base && addr < self.code_base
    }

    /// Start of the function table, directly after the image
    pub fn function_table_offset(&self) -> u64 {
        self.image_base as u64 + self.image_size as u64
    }

    /// The table holds one 8-byte slot per 4-byte instruction
    pub fn function_table_size(&self) -> u64 {
        self.code_size as u64 * 2
    }

    /// Slot offset for a code address, or `None` outside the code range
    pub fn function_slot_offset(&self, addr: u32) -> Option<u64> {
        if self.contains_code(addr) {
            Some(self.function_table_offset() + (addr - self.code_base) as u64 * 2)
        } else {
            None
        }
    }

    /// Reserved slot for the catch-all dynamic stub: the last aligned
    /// address of the code range.
    pub fn dynamic_stub_addr(&self) -> u32 {
        self.code_base + self.code_size - 4
    }

    /// Translate a guest address to its offset from the host base,
    /// applying the physical-space alias rule.
    pub fn host_offset(&self, addr: u64) -> u64 {
        if addr >= PHYSICAL_SPACE_BASE {
            addr + PHYSICAL_ALIAS_GAP
        } else {
            addr
        }
    }

    /// Region table for diagnostics and startup commit
    pub fn regions(&self) -> [Region; 6] {
        [
            Region {
                base: self.image_base,
                size: self.image_size,
                flags: RegionFlags::RW,
                name: "Image",
            },
            Region {
                base: self.code_base,
                size: self.code_size,
                flags: RegionFlags::RWX,
                name: "Code",
            },
            Region {
                base: self.stack_top - self.stack_size,
                size: self.stack_size,
                flags: RegionFlags::RW | RegionFlags::GROWS_DOWN,
                name: "Stack",
            },
            Region {
                base: self.kpcr_base,
                size: KERNEL_OBJECT_SIZE,
                flags: RegionFlags::RW,
                name: "KPCR",
            },
            Region {
                base: self.kthread_base,
                size: KERNEL_OBJECT_SIZE,
                flags: RegionFlags::RW,
                name: "KTHREAD",
            },
            Region {
                base: self.heap_base,
                size: self.heap_size,
                flags: RegionFlags::RW,
                name: "Heap",
            },
        ]
    }
}

/// Align an address down to its containing page
pub fn page_align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

/// Align an address up to the next page boundary
pub fn page_align_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}
