//! Yaz0, the LZ77 variant used for compressed files in the image.
//!
//! A stream starts with a 16-byte header (`"Yaz0"`, the big-endian decompressed size, eight zero
//! bytes). Tokens follow in groups of eight, each group led by a control byte read from the most
//! significant bit down. A set bit copies one literal byte. A clear bit introduces a back-reference
//! of two bytes `b1 b2`, plus a third byte `b3` when the high nibble of `b1` is zero:
//!
//! * distance `((b1 & 0xF) << 8 | b2) + 1` bytes back from the current output position
//! * length `(b1 >> 4) + 2`, or `b3 + 0x12` for the three-byte form
//!
//! References may overlap the bytes they produce, so copies run one byte at a time.

use byteorder::{BigEndian, ByteOrder};

pub const HEADER_SIZE: usize = 0x10;
pub const MAGIC: [u8; 4] = *b"Yaz0";

/// Slack allowed on top of the input size when encoding.
pub const ENCODE_SLACK: usize = 0x160;

const WINDOW: usize = 0x1000;
const MIN_MATCH: usize = 3;
const MAX_MATCH: usize = 0xFF + 0x12;
/// Longest length that fits in the two-byte form.
const SHORT_MATCH: usize = 0xF + 2;

const HASH_BITS: u32 = 15;
const NIL: usize = usize::max_value();

#[derive(Debug, Fail, PartialEq, Eq)]
pub enum Error {
    #[fail(display = "malformed stream at input offset {:#x}: {}", offset, reason)]
    MalformedStream { offset: usize, reason: &'static str },
    #[fail(display = "encoded stream exceeds its {:#x}-byte bound", bound)]
    BufferTooSmall { bound: usize },
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn byte(&mut self) -> Result<u8, Error> {
        let x = *self.data.get(self.pos).ok_or(Error::MalformedStream {
            offset: self.pos,
            reason: "stream ends early",
        })?;
        self.pos += 1;
        Ok(x)
    }
}

/// Expands `source` into exactly `size` bytes.
pub fn decode(source: &[u8], size: usize) -> Result<Vec<u8>, Error> {
    let mut input = Reader { data: source, pos: HEADER_SIZE };
    let mut out = Vec::with_capacity(size);
    let mut control = 0u8;
    let mut remaining = 0;

    while out.len() < size {
        if remaining == 0 {
            control = input.byte()?;
            remaining = 8;
        }

        if control & 0x80 != 0 {
            out.push(input.byte()?);
        } else {
            let at = input.pos;
            let b1 = input.byte()?;
            let b2 = input.byte()?;
            let distance = ((b1 as usize & 0x0F) << 8) | b2 as usize;
            let length = match b1 >> 4 {
                0 => input.byte()? as usize + 0x12,
                n => n as usize + 2,
            };
            let mut from = out.len().checked_sub(distance + 1).ok_or(Error::MalformedStream {
                offset: at,
                reason: "back-reference before start of output",
            })?;
            if out.len() + length > size {
                return Err(Error::MalformedStream { offset: at, reason: "back-reference overruns output" });
            }
            for _ in 0..length {
                let x = out[from];
                out.push(x);
                from += 1;
            }
        }

        control <<= 1;
        remaining -= 1;
    }

    Ok(out)
}

/// Compresses `raw`, failing if the result would exceed `raw.len() + ENCODE_SLACK` bytes.
pub fn encode(raw: &[u8]) -> Result<Vec<u8>, Error> {
    let bound = raw.len() + ENCODE_SLACK;
    let mut out = Vec::with_capacity(bound);
    out.extend_from_slice(&MAGIC);
    let mut size = [0; 4];
    BigEndian::write_u32(&mut size, raw.len() as u32);
    out.extend_from_slice(&size);
    out.extend_from_slice(&[0; 8]);

    let mut finder = MatchFinder::new(raw);
    let mut control_at = 0;
    let mut bit = 0u8;
    let mut pos = 0;
    while pos < raw.len() {
        if bit == 0 {
            control_at = out.len();
            out.push(0);
            bit = 0x80;
        }

        let (distance, length) = finder.longest(pos);
        if length < MIN_MATCH {
            out[control_at] |= bit;
            out.push(raw[pos]);
            finder.insert(pos);
            pos += 1;
        } else {
            let distance = distance - 1;
            if length > SHORT_MATCH {
                out.extend_from_slice(&[(distance >> 8) as u8, distance as u8, (length - 0x12) as u8]);
            } else {
                out.extend_from_slice(&[((length - 2) << 4 | distance >> 8) as u8, distance as u8]);
            }
            for p in pos..pos + length {
                finder.insert(p);
            }
            pos += length;
        }
        bit >>= 1;

        if out.len() > bound {
            return Err(Error::BufferTooSmall { bound });
        }
    }

    Ok(out)
}

/// Hash chains over three-byte prefixes, newest position first.
struct MatchFinder<'a> {
    data: &'a [u8],
    head: Vec<usize>,
    prev: Vec<usize>,
}

impl<'a> MatchFinder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, head: vec![NIL; 1 << HASH_BITS], prev: vec![NIL; data.len()] }
    }

    fn hash(&self, pos: usize) -> Option<usize> {
        let key = self.data.get(pos..pos + MIN_MATCH)?;
        let key = (key[0] as u32) << 16 | (key[1] as u32) << 8 | key[2] as u32;
        Some((key.wrapping_mul(0x9E37_79B1) >> (32 - HASH_BITS)) as usize)
    }

    fn insert(&mut self, pos: usize) {
        if let Some(h) = self.hash(pos) {
            self.prev[pos] = self.head[h];
            self.head[h] = pos;
        }
    }

    /// Longest match for `pos` as `(distance, length)`. Candidates are visited nearest first, so
    /// equal lengths resolve to the smallest distance.
    fn longest(&self, pos: usize) -> (usize, usize) {
        let limit = MAX_MATCH.min(self.data.len() - pos);
        let mut best = (0, 0);
        let h = match self.hash(pos) {
            Some(h) if limit >= MIN_MATCH => h,
            _ => return best,
        };

        let mut candidate = self.head[h];
        while candidate != NIL && pos - candidate <= WINDOW {
            let length = self.data[candidate..].iter()
                .zip(&self.data[pos..pos + limit])
                .take_while(|(a, b)| a == b)
                .count();
            if length > best.1 {
                best = (pos - candidate, length);
                if length == limit {
                    break;
                }
            }
            candidate = self.prev[candidate];
        }

        if best.1 < MIN_MATCH { (0, 0) } else { best }
    }
}
