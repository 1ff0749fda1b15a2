//! Compressed files kept from an earlier run.
//!
//! The archive pairs each compressed file's decompressed bytes with the bytes that were stored for
//! it, in table order. A later run reuses the stored bytes verbatim whenever a file's content is
//! unchanged, so rebuilding an unmodified image reproduces it exactly.

use std::fs;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use failure::ResultExt;
use rayon::prelude::*;

use crate::dma::{self, Directory};

const MAX_PREALLOCATED: u32 = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Decompressed content.
    pub reference: Vec<u8>,
    /// Bytes stored in the image for that content.
    pub compressed: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Archive {
    entries: Vec<Entry>,
}

impl Archive {
    pub fn new(entries: Vec<Entry>) -> Self { Self { entries } }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn entries(&self) -> &[Entry] { &self.entries }

    /// Stored bytes for `slot` if its reference matches `raw`.
    pub fn lookup(&self, slot: usize, raw: &[u8]) -> Option<&[u8]> {
        self.entries.get(slot)
            .filter(|x| x.reference == raw)
            .map(|x| &x.compressed[..])
    }

    /// Collects every compressed file of `output`, keyed by its content in `input`.
    pub fn build(input: &[u8], output: &[u8], dir: &Directory) -> Result<Self, dma::Error> {
        let entries = dir.files()
            .into_par_iter()
            .map(|i| -> Result<Option<Entry>, dma::Error> {
                let x = dir.entry(output, i)?;
                if x.is_placeholder() || !x.is_compressed() {
                    return Ok(None);
                }
                Ok(Some(Entry {
                    reference: dma::slice(input, x.virtual_range())?.to_vec(),
                    compressed: dma::slice(output, x.physical_range())?.to_vec(),
                }))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { entries: entries.into_iter().flatten().collect() })
    }

    /// Reads the archive at `path`, or `None` if there is no such file.
    pub fn load(path: &Path) -> Result<Option<Self>, failure::Error> {
        let file = match fs::File::open(path) {
            Ok(x) => x,
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => Err(e).with_context(|_| format!("failed to open {}", path.display()))?,
        };
        let archive = Self::read(BufReader::new(file))
            .with_context(|_| format!("failed to read archive {}", path.display()))?;
        Ok(Some(archive))
    }

    pub fn save(&self, path: &Path) -> Result<(), failure::Error> {
        let file = fs::File::create(path)
            .with_context(|_| format!("failed to create {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        self.write(&mut writer)
            .and_then(|()| writer.flush())
            .with_context(|_| format!("failed to write archive {}", path.display()))?;
        Ok(())
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let count = reader.read_u32::<LittleEndian>()?;
        // The count is untrusted; a damaged file runs out of data long before this fills.
        let mut entries = Vec::with_capacity(count.min(MAX_PREALLOCATED) as usize);
        for _ in 0..count {
            let reference = read_blob(&mut reader)?;
            let compressed = read_blob(&mut reader)?;
            entries.push(Entry { reference, compressed });
        }
        Ok(Self { entries })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(self.entries.len() as u32)?;
        for entry in &self.entries {
            write_blob(&mut writer, &entry.reference)?;
            write_blob(&mut writer, &entry.compressed)?;
        }
        Ok(())
    }
}

fn read_blob<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let len = reader.read_u32::<LittleEndian>()? as usize;
    let mut data = Vec::new();
    reader.take(len as u64).read_to_end(&mut data)?;
    if data.len() != len {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "archive entry is truncated"));
    }
    Ok(data)
}

fn write_blob<W: Write>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    writer.write_u32::<LittleEndian>(data.len() as u32)?;
    writer.write_all(data)
}
