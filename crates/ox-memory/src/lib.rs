//! Guest memory for the oxidized-xenon substrate
//!
//! This crate lays out and reserves the flat address space standing in
//! for the target machine: a 4 GiB virtual span, a physical mirror, and
//! the function-table area, with big-endian accessors over all of it.

pub mod address_space;
pub mod image;
pub mod layout;

pub use address_space::AddressSpace;
pub use image::load_flat_image;
pub use layout::{
    page_align_down, page_align_up, GuestLayout, Region, RegionFlags, GUEST_SPAN, PAGE_SIZE,
    PHYSICAL_ALIAS_GAP, PHYSICAL_SPACE_BASE, VIRTUAL_SPAN,
};
