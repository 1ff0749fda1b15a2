//! Loading whole images from disk.

use std::fs;
use std::path::Path;

use failure::ResultExt;

/// Size of an image whose files are stored compressed.
pub const COMPRESSED_SIZE: usize = 0x0200_0000;
/// Size of an image with every file stored at its virtual address.
pub const DECOMPRESSED_SIZE: usize = 0x0400_0000;

/// First byte of a dump stored with each 16-bit word byte-swapped.
const SWAPPED_MARKER: u8 = 0x37;

#[derive(Debug, Fail, PartialEq, Eq)]
pub enum Error {
    #[fail(display = "expected {:#x} bytes, found {:#x}", expected, actual)]
    ImageSizeError { expected: usize, actual: usize },
}

/// Reads `path`, which must be exactly `expected` bytes long, in big-endian byte order.
pub fn load(path: &Path, expected: usize) -> Result<Vec<u8>, failure::Error> {
    let mut image = fs::read(path).with_context(|_| format!("failed to read {}", path.display()))?;
    check_size(&image, expected).with_context(|_| format!("{} has the wrong size", path.display()))?;
    if normalize(&mut image) {
        info!("{} is byte-swapped; swapping to big-endian", path.display());
    }
    Ok(image)
}

pub fn check_size(image: &[u8], expected: usize) -> Result<(), Error> {
    if image.len() != expected {
        return Err(Error::ImageSizeError { expected, actual: image.len() });
    }
    Ok(())
}

/// Undoes 16-bit byte swapping. Returns whether the image was swapped.
pub fn normalize(image: &mut [u8]) -> bool {
    if image.first() != Some(&SWAPPED_MARKER) {
        return false;
    }
    for pair in image.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
    true
}
