//! Repacking an image: workers compress or copy each file, then a single pass lays the results
//! out back to back after the table.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use failure::ResultExt;
use rayon::prelude::*;

use crate::archive::Archive;
use crate::dma::{self, Directory, TableEntry, FIRST_FILE};
use crate::mask::Mask;
use crate::yaz0;
use crate::ErrorExt;

/// Compressed files are padded to this alignment.
const ALIGNMENT: usize = 16;

/// Interval between progress callbacks.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Fail, PartialEq, Eq)]
pub enum Error {
    #[fail(display = "files need {:#x} bytes but the image holds {:#x}", needed, capacity)]
    OutputOverflow { needed: usize, capacity: usize },
    #[fail(display = "file {}", index)]
    EntryFailed { index: usize },
    #[fail(display = "{} of {} files failed", count, total)]
    WorkersFailed { count: usize, total: usize },
}

/// What a worker produced for one table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub entry: TableEntry,
    pub compressed: bool,
    pub payload: Vec<u8>,
}

impl Output {
    pub fn size(&self) -> usize { self.payload.len() }
}

/// Snapshot of a run's progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Status {
    pub done: usize,
    pub total: usize,
    /// Decompressed bytes handled so far.
    pub bytes: u64,
    pub hits: usize,
}

/// Everything one repacking run shares between its workers.
pub struct Context<'a> {
    image: &'a [u8],
    dir: Directory,
    archive: Option<&'a Archive>,
    /// Archive slot of each index that gets compressed, in table order.
    slots: Vec<Option<usize>>,
    next: AtomicUsize,
    done: AtomicUsize,
    bytes: AtomicU64,
    hits: AtomicUsize,
}

/// One thread per core, less one for the coordinator.
pub fn default_workers() -> usize {
    num_cpus::get().saturating_sub(1).max(1)
}

fn align(size: usize) -> usize {
    (size + ALIGNMENT - 1) / ALIGNMENT * ALIGNMENT
}

impl<'a> Context<'a> {
    pub fn new(image: &'a [u8], dir: Directory, mask: &Mask, archive: Option<&'a Archive>)
               -> Result<Self, failure::Error>
    {
        mask.check(dir.count).context("reference mask doesn't cover the file table")?;

        let mut slots = vec![None; dir.count];
        let mut compressed = 0;
        for i in dir.files() {
            if !dir.entry(image, i)?.is_placeholder() && mask.compress(i) {
                slots[i] = Some(compressed);
                compressed += 1;
            }
        }
        if let Some(archive) = archive {
            if archive.len() != compressed {
                warn!("archive holds {} files but {} are to be compressed; expect misses",
                      archive.len(), compressed);
            }
        }

        Ok(Self {
            image,
            dir,
            archive,
            slots,
            next: AtomicUsize::new(FIRST_FILE),
            done: AtomicUsize::new(0),
            bytes: AtomicU64::new(0),
            hits: AtomicUsize::new(0),
        })
    }

    pub fn status(&self) -> Status {
        Status {
            done: self.done.load(Ordering::Relaxed),
            total: self.dir.files().len(),
            bytes: self.bytes.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
        }
    }

    /// Next unclaimed index, or `None` once the table is exhausted.
    fn claim(&self) -> Option<usize> {
        let i = self.next.fetch_add(1, Ordering::Relaxed);
        if i < self.dir.count { Some(i) } else { None }
    }

    fn process(&self, index: usize) -> Result<Option<Output>, failure::Error> {
        let entry = self.dir.entry(self.image, index)?;
        if entry.is_placeholder() {
            return Ok(None);
        }
        let raw = dma::slice(self.image, entry.virtual_range())?;
        self.bytes.fetch_add(raw.len() as u64, Ordering::Relaxed);

        let slot = match self.slots[index] {
            Some(x) => x,
            None => return Ok(Some(Output { entry, compressed: false, payload: raw.to_vec() })),
        };

        let payload = match self.archive.and_then(|x| x.lookup(slot, raw)) {
            Some(cached) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("file {}: reusing archive slot {}", index, slot);
                cached.to_vec()
            }
            None => {
                if self.archive.is_some() {
                    debug!("file {}: archive slot {} doesn't match", index, slot);
                }
                let mut encoded = yaz0::encode(raw)?;
                encoded.resize(align(encoded.len()), 0);
                debug!("file {}: {:#x} -> {:#x} bytes", index, raw.len(), encoded.len());
                encoded
            }
        };
        Ok(Some(Output { entry, compressed: true, payload }))
    }

    /// Processes every file on `workers` threads, calling `tick` periodically while they run.
    ///
    /// The result holds one slot per table entry; placeholders and bookkeeping entries are `None`.
    pub fn run<F>(&self, workers: usize, tick: F) -> Result<Vec<Option<Output>>, failure::Error>
        where F: FnMut(Status)
    {
        self.run_every(workers, TICK_INTERVAL, tick)
    }

    fn run_every<F>(&self, workers: usize, interval: Duration, mut tick: F)
                    -> Result<Vec<Option<Output>>, failure::Error>
        where F: FnMut(Status)
    {
        let mut outputs = (0..self.dir.count).map(|_| None).collect::<Vec<_>>();
        let mut errors = Vec::new();

        thread::scope(|scope| {
            let (send, recv) = mpsc::sync_channel(16);
            for _ in 0..workers.max(1) {
                let send = send.clone();
                scope.spawn(move || {
                    while let Some(i) = self.claim() {
                        let result = self.process(i)
                            .with_context(|_| Error::EntryFailed { index: i })
                            .map_err(failure::Error::from);
                        self.done.fetch_add(1, Ordering::Relaxed);
                        if send.send((i, result)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(send);

            let mut last_tick = Instant::now();
            loop {
                let wait = interval.checked_sub(last_tick.elapsed()).unwrap_or_default();
                match recv.recv_timeout(wait) {
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    Ok((i, Ok(output))) => outputs[i] = output,
                    Ok((_, Err(e))) => {
                        error!("{}", e.pretty());
                        errors.push(e);
                    }
                }
                if last_tick.elapsed() >= interval {
                    tick(self.status());
                    last_tick = Instant::now();
                }
            }
        });
        tick(self.status());

        let status = self.status();
        if !errors.is_empty() {
            let count = errors.len();
            let first = errors.swap_remove(0);
            return Err(first.context(Error::WorkersFailed { count, total: status.total }).into());
        }
        info!("processed {} files ({} bytes), {} from the archive", status.done, status.bytes, status.hits);
        Ok(outputs)
    }

    /// Builds an image of `size` bytes: everything up to the end of the table is copied from the
    /// input, then `outputs` follow in table order with their entries rewritten to match.
    pub fn assemble(&self, outputs: &[Option<Output>], size: usize) -> Result<Vec<u8>, failure::Error> {
        let head = self.dir.end();
        let needed = head + outputs.iter().flatten().map(Output::size).sum::<usize>();
        if needed > size {
            return Err(Error::OutputOverflow { needed, capacity: size }.into());
        }

        let mut image = vec![0; size];
        image[..head].copy_from_slice(dma::slice(self.image, 0..head)?);

        let mut cursor = head;
        for (i, output) in outputs.iter().enumerate().skip(FIRST_FILE) {
            let output = match *output {
                Some(ref x) => x,
                None => continue,
            };
            let end = cursor + output.size();
            image[cursor..end].copy_from_slice(&output.payload);
            let entry = TableEntry {
                start_p: cursor as u32,
                end_p: if output.compressed { end as u32 } else { 0 },
                ..output.entry
            };
            self.dir.set_entry(&mut image, i, &entry)?;
            cursor = end;
        }
        info!("laid out {:#x} bytes of {:#x}", cursor, size);
        Ok(image)
    }
}

/// Builds an image of `size` bytes with every file of `image` stored raw at its virtual address.
pub fn decompress(image: &[u8], dir: &Directory, size: usize) -> Result<Vec<u8>, failure::Error> {
    let head = dir.end();
    let mut out = vec![0; size];
    dma::slice_mut(&mut out, 0..head)?.copy_from_slice(dma::slice(image, 0..head)?);

    let files = dir.files()
        .into_par_iter()
        .map(|i| -> Result<(usize, TableEntry, Option<Vec<u8>>), failure::Error> {
            let entry = dir.entry(image, i)?;
            if entry.is_placeholder() {
                return Ok((i, entry, None));
            }
            let stored = dma::slice(image, entry.physical_range())?;
            let data = if entry.is_compressed() {
                yaz0::decode(stored, entry.virtual_size()).with_context(|_| Error::EntryFailed { index: i })?
            } else {
                stored.to_vec()
            };
            Ok((i, entry, Some(data)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    // Placeholders are rewritten too, but carry no bytes.
    for (i, entry, data) in files {
        if let Some(data) = data {
            dma::slice_mut(&mut out, entry.virtual_range())?.copy_from_slice(&data);
        }
        dir.set_entry(&mut out, i, &TableEntry { start_p: entry.start_v, end_p: 0, ..entry })?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::testing::{self, TABLE_OFFSET};
    use crate::dma::ENTRY_SIZE;
    use test_log::test;

    const SIZE: usize = 0x4000;

    fn text(len: usize, salt: u8) -> Vec<u8> {
        (0..len).map(|i| b"abcdefgh"[(i / 5 + salt as usize) % 8] ^ (i % 3) as u8).collect()
    }

    fn noise(len: usize, mut seed: u32) -> Vec<u8> {
        (0..len).map(|_| {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            seed as u8
        }).collect()
    }

    /// Five files: raw, compressed, placeholder, compressed, raw.
    fn sample() -> (Vec<u8>, Mask) {
        let files = [text(0x100, 0), text(0x230, 1), vec![], vec![0xAA; 0x81], noise(0x40, 3)];
        let entries = [
            testing::raw(0x1000, 0x100),
            testing::raw(0x1100, 0x230),
            testing::raw(0x1400, 0),
            testing::raw(0x1400, 0x81),
            testing::raw(0x1500, 0x40),
        ];
        let pairs = entries.iter().cloned()
            .zip(files.iter().map(|x| &x[..]))
            .collect::<Vec<_>>();
        let mask = Mask::parse("111 01010").unwrap();
        (testing::image(SIZE, &pairs), mask)
    }

    fn repack(image: &[u8], mask: &Mask, archive: Option<&Archive>) -> (Vec<u8>, Status) {
        let dir = Directory::find(image).unwrap();
        let ctx = Context::new(image, dir, mask, archive).unwrap();
        let outputs = ctx.run(3, |_| {}).unwrap();
        (ctx.assemble(&outputs, SIZE).unwrap(), ctx.status())
    }

    #[test]
    fn single_file() {
        let input = testing::image(SIZE, &[(testing::raw(0x1000, 16), &[0xAA; 16])]);
        let mask = Mask::parse("1111").unwrap();
        let (output, status) = repack(&input, &mask, None);
        assert_eq!(status, Status { done: 1, total: 1, bytes: 16, hits: 0 });

        let dir = Directory::find(&output).unwrap();
        let entry = dir.entry(&output, 3).unwrap();
        let head = (TABLE_OFFSET + 4 * ENTRY_SIZE) as u32;
        assert_eq!(entry, TableEntry { start_v: 0x1000, end_v: 0x1010, start_p: head, end_p: head + 0x20 });
        let stored = &output[entry.physical_range()];
        assert_eq!(yaz0::decode(stored, 16).unwrap(), vec![0xAA; 16]);
    }

    #[test]
    fn claims_each_file_once() {
        let (input, mask) = sample();
        let dir = Directory::find(&input).unwrap();
        let ctx = Context::new(&input, dir, &mask, None).unwrap();
        let claimed = ::std::iter::from_fn(|| ctx.claim()).collect::<Vec<_>>();
        assert_eq!(claimed, (3..8).collect::<Vec<_>>());
        assert_eq!(ctx.claim(), None);
    }

    #[test]
    fn layout() {
        let (input, mask) = sample();
        let (output, status) = repack(&input, &mask, None);
        assert_eq!(status.done, 5);

        let before = Directory::find(&input).unwrap();
        let dir = Directory::find(&output).unwrap();
        assert_eq!(dir, before);
        assert_eq!(&output[..dir.offset + 3 * ENTRY_SIZE], &input[..dir.offset + 3 * ENTRY_SIZE]);

        // The placeholder keeps its original bytes.
        let placeholder = dir.offset + 5 * ENTRY_SIZE;
        assert_eq!(&output[placeholder..placeholder + ENTRY_SIZE], &input[placeholder..placeholder + ENTRY_SIZE]);

        let mut cursor = dir.end() as u32;
        for i in [3, 4, 6, 7].iter().cloned() {
            let entry = dir.entry(&output, i).unwrap();
            let original = before.entry(&input, i).unwrap();
            assert_eq!(entry.virtual_range(), original.virtual_range());
            assert_eq!(entry.start_p, cursor, "file {}", i);
            assert_eq!(entry.is_compressed(), mask.compress(i));

            let stored = &output[entry.physical_range()];
            let content = if entry.is_compressed() {
                assert_eq!(stored.len() % 16, 0);
                yaz0::decode(stored, entry.virtual_size()).unwrap()
            } else {
                stored.to_vec()
            };
            assert_eq!(&content[..], &input[original.virtual_range()]);
            cursor = entry.physical_range().end as u32;
        }
    }

    #[test]
    fn archive_reproduces_payloads() {
        let (input, mask) = sample();
        let (first, _) = repack(&input, &mask, None);
        let dir = Directory::find(&first).unwrap();
        let archive = Archive::build(&input, &first, &dir).unwrap();
        assert_eq!(archive.len(), 2);

        let (second, status) = repack(&input, &mask, Some(&archive));
        assert_eq!(status.hits, 2);
        assert_eq!(second, first);
    }

    #[test]
    fn archive_hits_skip_encoding() {
        let (input, mask) = sample();
        let (first, _) = repack(&input, &mask, None);
        let dir = Directory::find(&first).unwrap();
        let built = Archive::build(&input, &first, &dir).unwrap();

        let mut entries = built.entries().to_vec();
        entries[1].compressed = vec![0x5A; 0x30];
        let archive = Archive::new(entries);

        let (output, status) = repack(&input, &mask, Some(&archive));
        assert_eq!(status.hits, 2);
        let entry = dir.entry(&output, 6).unwrap();
        assert_eq!(&output[entry.physical_range()], &[0x5A; 0x30][..]);
    }

    #[test]
    fn changed_file_misses_archive() {
        let (input, mask) = sample();
        let (first, _) = repack(&input, &mask, None);
        let dir = Directory::find(&first).unwrap();
        let archive = Archive::build(&input, &first, &dir).unwrap();

        let mut edited = input.clone();
        edited[0x1100] ^= 0xFF;
        let (output, status) = repack(&edited, &mask, Some(&archive));
        assert_eq!(status.hits, 1);

        let entry = dir.entry(&output, 4).unwrap();
        let content = yaz0::decode(&output[entry.physical_range()], entry.virtual_size()).unwrap();
        assert_eq!(&content[..], &edited[0x1100..0x1330]);
    }

    #[test]
    fn ticks_while_results_arrive() {
        let (input, mask) = sample();
        let dir = Directory::find(&input).unwrap();
        let ctx = Context::new(&input, dir, &mask, None).unwrap();
        let mut ticks = Vec::new();
        ctx.run_every(1, Duration::from_millis(0), |x| ticks.push(x)).unwrap();
        // One per message plus the final one.
        assert!(ticks.len() >= 6, "{} ticks", ticks.len());
        assert!(ticks.windows(2).all(|x| x[0].done <= x[1].done));
        assert_eq!(ticks.last().map(|x| x.done), Some(5));
    }

    #[test]
    fn short_mask() {
        let (input, _) = sample();
        let dir = Directory::find(&input).unwrap();
        let mask = Mask::parse("1111").unwrap();
        assert!(Context::new(&input, dir, &mask, None).is_err());
    }

    #[test]
    fn failures_are_collected() {
        let big = noise(0x1000, 17);
        let input = testing::image(SIZE, &[
            (testing::raw(0x1000, 0x20), &[1; 0x20]),
            (testing::raw(0x2000, 0x1000), &big),
        ]);
        let mask = Mask::parse("11111").unwrap();
        let dir = Directory::find(&input).unwrap();
        let ctx = Context::new(&input, dir, &mask, None).unwrap();
        let e = ctx.run(2, |_| {}).unwrap_err();
        assert_eq!(e.to_string(), "1 of 2 files failed");
        assert_eq!(e.pretty().to_string(),
                   "1 of 2 files failed: file 4: encoded stream exceeds its 0x1160-byte bound");
        match e.find_root_cause().downcast_ref::<yaz0::Error>() {
            Some(yaz0::Error::BufferTooSmall { .. }) => {}
            x => panic!("unexpected {:?}", x),
        }
        assert_eq!(ctx.status().done, 2);
    }

    #[test]
    fn output_overflow() {
        let (input, mask) = sample();
        let dir = Directory::find(&input).unwrap();
        let ctx = Context::new(&input, dir, &mask, None).unwrap();
        let outputs = ctx.run(1, |_| {}).unwrap();
        let e = ctx.assemble(&outputs, dir.end() + 0x10).unwrap_err();
        match e.downcast_ref::<Error>() {
            Some(Error::OutputOverflow { .. }) => {}
            x => panic!("unexpected {:?}", x),
        }
    }

    #[test]
    fn decompress_restores_input() {
        let (input, mask) = sample();
        let (packed, _) = repack(&input, &mask, None);
        let dir = Directory::find(&packed).unwrap();
        let unpacked = decompress(&packed, &dir, SIZE).unwrap();
        assert_eq!(unpacked, input);
    }

    #[test]
    fn decompress_rewrites_placeholders() {
        let (input, mask) = sample();
        let (mut packed, _) = repack(&input, &mask, None);
        let dir = Directory::find(&packed).unwrap();
        let stale = TableEntry { start_v: 0x1400, end_v: 0x1400, start_p: 0x3000, end_p: 0x3010 };
        dir.set_entry(&mut packed, 5, &stale).unwrap();
        let unpacked = decompress(&packed, &dir, SIZE).unwrap();
        assert_eq!(dir.entry(&unpacked, 5).unwrap(),
                   TableEntry { start_v: 0x1400, end_v: 0x1400, start_p: 0x1400, end_p: 0 });
        assert_eq!(unpacked, input);
    }

    #[test]
    fn decompress_reports_bad_stream() {
        let (input, mask) = sample();
        let (mut packed, _) = repack(&input, &mask, None);
        let dir = Directory::find(&packed).unwrap();
        let entry = dir.entry(&packed, 4).unwrap();
        // Truncate the stream so it ends early.
        let short = TableEntry { end_p: entry.start_p + 0x12, ..entry };
        dir.set_entry(&mut packed, 4, &short).unwrap();
        let e = decompress(&packed, &dir, SIZE).unwrap_err();
        match e.find_root_cause().downcast_ref::<yaz0::Error>() {
            Some(yaz0::Error::MalformedStream { .. }) => {}
            x => panic!("unexpected {:?}", x),
        }
    }
}
