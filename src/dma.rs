//! The DMA table: the directory of sub-files embedded in the image.

use std::ops::Range;

use byteorder::{BigEndian, ByteOrder};

/// On-disk size of one table entry.
pub const ENTRY_SIZE: usize = 16;

/// Entries below this index describe the table itself and are never repacked.
pub const FIRST_FILE: usize = 3;

/// Build identification preceding the table ("zelda@srd").
const BUILD_MAGIC: [u32; 2] = [0x7A65_6C64, 0x6140_7372];
const BUILD_MAGIC_TAIL: u32 = 0x6400_0000;
/// Virtual start of entry 1, found in the first word of the second entry.
const TABLE_MARKER: u32 = 0x0000_1060;

#[derive(Debug, Fail, PartialEq, Eq)]
pub enum Error {
    #[fail(display = "couldn't find the file table")]
    DirectoryNotFound,
    #[fail(display = "range {:#x}..{:#x} lies outside the image ({:#x} bytes)", start, end, len)]
    OutOfBounds { start: usize, end: usize, len: usize },
    #[fail(display = "table entry {} ends before it starts", index)]
    BadEntry { index: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableEntry {
    pub start_v: u32,
    pub end_v: u32,
    pub start_p: u32,
    pub end_p: u32,
}

impl TableEntry {
    pub fn read(bytes: &[u8]) -> Self {
        Self {
            start_v: BigEndian::read_u32(&bytes[0..4]),
            end_v: BigEndian::read_u32(&bytes[4..8]),
            start_p: BigEndian::read_u32(&bytes[8..12]),
            end_p: BigEndian::read_u32(&bytes[12..16]),
        }
    }

    pub fn write(&self, bytes: &mut [u8]) {
        BigEndian::write_u32(&mut bytes[0..4], self.start_v);
        BigEndian::write_u32(&mut bytes[4..8], self.end_v);
        BigEndian::write_u32(&mut bytes[8..12], self.start_p);
        BigEndian::write_u32(&mut bytes[12..16], self.end_p);
    }

    /// An unused slot; carries no content.
    pub fn is_placeholder(&self) -> bool { self.start_v == self.end_v }

    pub fn is_compressed(&self) -> bool { self.end_p != 0 }

    pub fn virtual_size(&self) -> usize { self.end_v.saturating_sub(self.start_v) as usize }

    pub fn virtual_range(&self) -> Range<usize> {
        self.start_v as usize..self.end_v as usize
    }

    /// Bytes the entry occupies in the image it was read from.
    pub fn physical_range(&self) -> Range<usize> {
        let start = self.start_p as usize;
        if self.is_compressed() {
            start..self.end_p as usize
        } else {
            start..start + self.virtual_size()
        }
    }
}

/// Location of the table inside an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Directory {
    pub offset: usize,
    pub count: usize,
}

impl Directory {
    /// Scans `image` for the build string and the table that follows it.
    pub fn find(image: &[u8]) -> Result<Self, Error> {
        let offset = locate(image).ok_or(Error::DirectoryNotFound)?;
        let tail = image.get(offset + 2 * ENTRY_SIZE..offset + 3 * ENTRY_SIZE)
            .ok_or(Error::DirectoryNotFound)?;
        let table = TableEntry::read(tail);
        if table.end_v < table.start_v {
            return Err(Error::BadEntry { index: 2 });
        }
        let dir = Self { offset, count: table.virtual_size() / ENTRY_SIZE };
        if dir.count < FIRST_FILE || dir.end() > image.len() {
            return Err(Error::OutOfBounds { start: dir.offset, end: dir.end(), len: image.len() });
        }
        Ok(dir)
    }

    pub fn size(&self) -> usize { self.count * ENTRY_SIZE }

    /// First byte past the table.
    pub fn end(&self) -> usize { self.offset + self.size() }

    pub fn entry(&self, image: &[u8], index: usize) -> Result<TableEntry, Error> {
        let start = self.entry_offset(index);
        let bytes = slice(image, start..start + ENTRY_SIZE)?;
        let entry = TableEntry::read(bytes);
        if entry.end_v < entry.start_v {
            return Err(Error::BadEntry { index });
        }
        Ok(entry)
    }

    pub fn set_entry(&self, image: &mut [u8], index: usize, entry: &TableEntry) -> Result<(), Error> {
        let start = self.entry_offset(index);
        let bytes = slice_mut(image, start..start + ENTRY_SIZE)?;
        entry.write(bytes);
        Ok(())
    }

    /// Indices subject to repacking.
    pub fn files(&self) -> Range<usize> { FIRST_FILE..self.count }

    fn entry_offset(&self, index: usize) -> usize {
        debug_assert!(index < self.count);
        self.offset + index * ENTRY_SIZE
    }
}

fn locate(image: &[u8]) -> Option<usize> {
    let word = |at: usize| image.get(at..at + 4).map(BigEndian::read_u32);
    let mut i = 0;
    while i + ENTRY_SIZE <= image.len() {
        if word(i) == Some(BUILD_MAGIC[0]) && word(i + 4) == Some(BUILD_MAGIC[1])
            && word(i + 8).map_or(false, |x| x & 0xFF00_0000 == BUILD_MAGIC_TAIL)
        {
            let mut j = i + 2 * ENTRY_SIZE;
            loop {
                match word(j) {
                    Some(TABLE_MARKER) => return Some(j - ENTRY_SIZE),
                    Some(_) => j += ENTRY_SIZE,
                    None => return None,
                }
            }
        }
        i += ENTRY_SIZE;
    }
    None
}

/// Bounds-checked view into an image.
pub fn slice(image: &[u8], range: Range<usize>) -> Result<&[u8], Error> {
    let len = image.len();
    image.get(range.clone()).ok_or(Error::OutOfBounds { start: range.start, end: range.end, len })
}

pub fn slice_mut(image: &mut [u8], range: Range<usize>) -> Result<&mut [u8], Error> {
    let len = image.len();
    image.get_mut(range.clone()).ok_or(Error::OutOfBounds { start: range.start, end: range.end, len })
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::testing::*;
    use test_log::test;

    #[test]
    fn entry_layout_is_big_endian() {
        let entry = TableEntry { start_v: 0x1000, end_v: 0x1010, start_p: 0x2000, end_p: 0x2008 };
        let mut bytes = [0; ENTRY_SIZE];
        entry.write(&mut bytes);
        assert_eq!(&bytes[..8], &[0, 0, 0x10, 0, 0, 0, 0x10, 0x10]);
        assert_eq!(TableEntry::read(&bytes), entry);
        assert_eq!(entry.physical_range(), 0x2000..0x2008);

        let stored = TableEntry { end_p: 0, ..entry };
        assert_eq!(stored.physical_range(), 0x2000..0x2010);
    }

    #[test]
    fn finds_table() {
        let image = image(0x2000, &[(raw(0x1000, 0x10), &[1; 0x10])]);
        let dir = Directory::find(&image).unwrap();
        assert_eq!(dir, Directory { offset: TABLE_OFFSET, count: 4 });
        assert_eq!(dir.end(), TABLE_OFFSET + 4 * ENTRY_SIZE);
        assert_eq!(dir.entry(&image, 3).unwrap(), raw(0x1000, 0x10));
        assert_eq!(dir.files(), 3..4);
    }

    #[test]
    fn missing_build_string() {
        let mut image = image(0x2000, &[]);
        image[0x40] = 0;
        assert_eq!(Directory::find(&image), Err(Error::DirectoryNotFound));
    }

    #[test]
    fn missing_marker() {
        let mut image = image(0x2000, &[]);
        // Break the marker in entry 1 and in entry 0's end address.
        image[TABLE_OFFSET + 4..TABLE_OFFSET + 24].iter_mut().for_each(|x| *x = 0);
        assert_eq!(Directory::find(&image), Err(Error::DirectoryNotFound));
    }

    #[test]
    fn table_past_end() {
        let mut image = image(0x2000, &[]);
        let dir = Directory { offset: TABLE_OFFSET, count: 3 };
        let huge = TableEntry { start_v: TABLE_OFFSET as u32, end_v: 0x10_0000, start_p: 0, end_p: 0 };
        dir.set_entry(&mut image, 2, &huge).unwrap();
        match Directory::find(&image) {
            Err(Error::OutOfBounds { .. }) => {}
            x => panic!("unexpected {:?}", x),
        }
    }

    #[test]
    fn inverted_entry() {
        let bad = TableEntry { start_v: 0x1010, end_v: 0x1000, start_p: 0, end_p: 0 };
        let image = image(0x2000, &[(raw(0x1000, 0), &[])]);
        let dir = Directory::find(&image).unwrap();
        let mut image = image;
        dir.set_entry(&mut image, 3, &bad).unwrap();
        assert_eq!(dir.entry(&image, 3), Err(Error::BadEntry { index: 3 }));
    }

    #[test]
    fn bounds_checked_views() {
        let image = [0u8; 8];
        assert!(slice(&image, 4..8).is_ok());
        assert_eq!(slice(&image, 4..9), Err(Error::OutOfBounds { start: 4, end: 9, len: 8 }));
    }
}
