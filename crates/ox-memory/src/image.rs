//! Flat image loading
//!
//! The recompilation toolchain pre-extracts the executable's sections
//! into one flat file covering the image region. Loading is a straight
//! copy to `image_base`; relocation and decryption happened offline.

use std::path::Path;

use ox_core::error::ImageError;
use tracing::info;

use crate::address_space::AddressSpace;

/// Load a pre-extracted flat image into the image region.
/// Returns the number of bytes copied.
pub fn load_flat_image(space: &AddressSpace, path: &Path) -> Result<u64, ImageError> {
    let layout = *space.layout();
    let data = std::fs::read(path)?;

    if data.len() as u64 > layout.image_size as u64 {
        return Err(ImageError::TooLarge {
            size: data.len() as u64,
            max: layout.image_size as u64,
        });
    }

    space.write_bytes(layout.image_base as u64, &data)?;

    info!(
        "Loaded image {} ({} bytes at 0x{:08X})",
        path.display(),
        data.len(),
        layout.image_base
    );
    Ok(data.len() as u64)
}
