//! Boot checksum over the first megabyte of game code.

use byteorder::{BigEndian, ByteOrder};

const HEADER_SIZE: usize = 0x40;
const BOOT_CODE_END: usize = 0x1000;
const CRC1_OFFSET: usize = 0x10;
const CRC2_OFFSET: usize = 0x14;

const CHECKSUM_START: usize = 0x1000;
const CHECKSUM_LENGTH: usize = 0x0010_0000;
const CHECKSUM_END: usize = CHECKSUM_START + CHECKSUM_LENGTH;

#[derive(Debug, Fail, PartialEq, Eq)]
pub enum Error {
    #[fail(display = "image is {:#x} bytes, too small to checksum", len)]
    ImageTooSmall { len: usize },
    #[fail(display = "unsupported boot code (CRC-32 {:08x})", crc)]
    UnsupportedBootCode { crc: u32 },
}

/// Boot code variants; each seeds the checksum differently.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Cic {
    Cic6101,
    Cic6102,
    Cic6103,
    Cic6105,
    Cic6106,
}

impl Cic {
    /// Identifies the boot code stored after the image header.
    pub fn detect(image: &[u8]) -> Result<Self, Error> {
        let code = image.get(HEADER_SIZE..BOOT_CODE_END).ok_or(Error::ImageTooSmall { len: image.len() })?;
        Ok(match crc32fast::hash(code) {
            0x6170_A4A1 => Cic::Cic6101,
            0x90BB_6CB5 => Cic::Cic6102,
            0x0B05_0EE0 => Cic::Cic6103,
            0x98BC_2C86 => Cic::Cic6105,
            0xACC8_580A => Cic::Cic6106,
            crc => return Err(Error::UnsupportedBootCode { crc }),
        })
    }

    fn seed(self) -> u32 {
        match self {
            Cic::Cic6101 | Cic::Cic6102 => 0xF8CA_4DDC,
            Cic::Cic6103 => 0xA388_6759,
            Cic::Cic6105 => 0xDF26_F436,
            Cic::Cic6106 => 0x1FEA_617A,
        }
    }
}

/// Computes the two checksum words for `image` as booted by `cic`.
pub fn calculate(image: &[u8], cic: Cic) -> Result<(u32, u32), Error> {
    if image.len() < CHECKSUM_END {
        return Err(Error::ImageTooSmall { len: image.len() });
    }

    let seed = cic.seed();
    let (mut t1, mut t2, mut t3, mut t4, mut t5, mut t6) = (seed, seed, seed, seed, seed, seed);
    for i in (CHECKSUM_START..CHECKSUM_END).step_by(4) {
        let d = BigEndian::read_u32(&image[i..]);
        let (sum, carry) = t6.overflowing_add(d);
        if carry {
            t4 = t4.wrapping_add(1);
        }
        t6 = sum;
        t3 ^= d;
        let r = d.rotate_left(d & 0x1F);
        t5 = t5.wrapping_add(r);
        if t2 > d {
            t2 ^= r;
        } else {
            t2 ^= t6 ^ d;
        }
        t1 = t1.wrapping_add(match cic {
            Cic::Cic6105 => {
                let at = HEADER_SIZE + 0x0710 + (i & 0xFF);
                BigEndian::read_u32(&image[at..]) ^ d
            }
            _ => t5 ^ d,
        });
    }

    Ok(match cic {
        Cic::Cic6103 => ((t6 ^ t4).wrapping_add(t3), (t5 ^ t2).wrapping_add(t1)),
        Cic::Cic6106 => (t6.wrapping_mul(t4).wrapping_add(t3), t5.wrapping_mul(t2).wrapping_add(t1)),
        _ => (t6 ^ t4 ^ t3, t5 ^ t2 ^ t1),
    })
}

/// Recomputes and stores the checksum in the image header.
pub fn fix(image: &mut [u8]) -> Result<Cic, Error> {
    let cic = Cic::detect(image)?;
    let (crc1, crc2) = calculate(image, cic)?;
    BigEndian::write_u32(&mut image[CRC1_OFFSET..], crc1);
    BigEndian::write_u32(&mut image[CRC2_OFFSET..], crc2);
    debug!("checksum for {:?}: {:08x} {:08x}", cic, crc1, crc2);
    Ok(cic)
}
