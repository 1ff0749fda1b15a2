#[macro_use]
extern crate failure;
#[macro_use]
extern crate log;

use std::{fmt, fs};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use failure::{Error, Fail, ResultExt};
use yapb::{Spinner, Progress};

use crate::archive::Archive;
use crate::dma::Directory;
use crate::mask::Mask;

mod archive;
mod crc;
mod dma;
mod image;
mod mask;
mod pipeline;
mod yaz0;

type Result<T> = std::result::Result<T, Error>;

pub struct PrettyErr<'a>(&'a dyn Fail);
impl<'a> fmt::Display for PrettyErr<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)?;
        let mut x: &dyn Fail = self.0;
        while let Some(cause) = x.cause() {
            f.write_str(": ")?;
            fmt::Display::fmt(&cause, f)?;
            x = cause;
        }
        Ok(())
    }
}

pub trait ErrorExt {
    fn pretty(&self) -> PrettyErr;
}

impl ErrorExt for Error {
    fn pretty(&self) -> PrettyErr { PrettyErr(self.as_fail()) }
}

fn input_arg<'a, 'b>() -> Arg<'a, 'b> {
    Arg::with_name("INPUT")
        .help("image to read")
        .required(true)
}

fn output_arg<'a, 'b>() -> Arg<'a, 'b> {
    Arg::with_name("OUTPUT")
        .long("output")
        .short("o")
        .takes_value(true)
        .help("image to write; defaults to the input name with a suffix")
}

fn app<'a, 'b>() -> App<'a, 'b> {
    App::new("dmapack")
        .version("0.1")
        .about("Repacks the file table of a ROM image")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommand(SubCommand::with_name("compress")
            .about("Compresses the files of a decompressed image")
            .arg(input_arg())
            .arg(output_arg())
            .arg(Arg::with_name("MASK")
                 .long("mask")
                 .short("m")
                 .help("file of 0/1 digits selecting the entries to compress")
                 .default_value("table.txt"))
            .arg(Arg::with_name("ARCHIVE")
                 .long("archive")
                 .short("a")
                 .help("compressed files kept from an earlier run; created if missing")
                 .default_value("ARCHIVE.bin"))
            .arg(Arg::with_name("THREADS")
                 .long("threads")
                 .short("j")
                 .takes_value(true)
                 .help("number of compression threads")
                 .validator(|x| match x.parse::<usize>() {
                     Ok(0) => Err("must be at least 1".into()),
                     Ok(_) => Ok(()),
                     Err(e) => Err(e.to_string()),
                 })))
        .subcommand(SubCommand::with_name("decompress")
            .about("Stores every file of a compressed image raw at its virtual address")
            .arg(input_arg())
            .arg(output_arg()))
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = app().get_matches();
    let result = match args.subcommand() {
        ("compress", Some(args)) => Options::new(args, "comp").and_then(|x| compress(&x)),
        ("decompress", Some(args)) => Options::new(args, "decomp").and_then(|x| decompress(&x)),
        _ => unreachable!(),
    };

    if let Err(e) = result {
        eprintln!("FATAL: {}", e.pretty());
        ::std::process::exit(1);
    }
}

struct Options {
    input: PathBuf,
    output: PathBuf,
    mask: PathBuf,
    archive: PathBuf,
    workers: usize,
}

impl Options {
    fn new(args: &ArgMatches, suffix: &str) -> Result<Self> {
        let input = PathBuf::from(args.value_of_os("INPUT").ok_or_else(|| format_err!("missing input"))?);
        let output = match args.value_of_os("OUTPUT") {
            Some(x) => PathBuf::from(x),
            None => sibling(&input, suffix)?,
        };
        let workers = match args.value_of("THREADS") {
            Some(x) => x.parse::<usize>().context("invalid thread count")?,
            None => pipeline::default_workers(),
        };
        Ok(Self {
            input,
            output,
            mask: args.value_of_os("MASK").map_or_else(|| "table.txt".into(), PathBuf::from),
            archive: args.value_of_os("ARCHIVE").map_or_else(|| "ARCHIVE.bin".into(), PathBuf::from),
            workers,
        })
    }
}

/// `dir/name.z64` -> `dir/name-suffix.z64`
fn sibling(input: &Path, suffix: &str) -> Result<PathBuf> {
    let stem = input.file_stem()
        .and_then(|x| x.to_str())
        .ok_or_else(|| format_err!("can't derive an output name from {}", input.display()))?;
    Ok(input.with_file_name(format!("{}-{}.z64", stem, suffix)))
}

fn seconds(start: Instant) -> f64 {
    let time = Instant::now() - start;
    time.as_secs() as f64 + time.subsec_nanos() as f64 * 1e-9
}

fn compress(opts: &Options) -> Result<()> {
    let stdout = io::stdout();
    let mut stdout = stdout.lock();

    let input = image::load(&opts.input, image::DECOMPRESSED_SIZE)?;
    let dir = Directory::find(&input)
        .with_context(|_| format!("failed to read the file table of {}", opts.input.display()))?;
    let mask = Mask::load(&opts.mask)?;
    let archive = Archive::load(&opts.archive)?;
    match archive {
        Some(ref x) => writeln!(stdout, "loaded archive of {} files", x.len())?,
        None => writeln!(stdout, "no archive found, this could take a while")?,
    }

    let ctx = pipeline::Context::new(&input, dir, &mask, archive.as_ref())?;
    let start_time = Instant::now();
    let outputs = {
        let mut bar = yapb::Bar::new();
        let mut spinner = yapb::Snake::new();
        let mut throughput = None;
        let mut last_bytes = 0;
        let mut last_tick = start_time;
        let stdout = &mut stdout;
        ctx.run(opts.workers, |status| {
            let width = termion::terminal_size().map(|(w, _)| w as usize).unwrap_or(80);
            let elapsed = seconds(last_tick).max(1e-3);
            last_tick = Instant::now();
            let rate = ((status.bytes - last_bytes) as f64 / elapsed) as f32;
            if throughput.is_none() {
                throughput = Some(yapb::MovingAverage::new(0.05, rate));
            } else if let Some(ref mut x) = throughput {
                x.update(rate);
            }
            last_bytes = status.bytes;
            bar.set(status.done as f32 / status.total.max(1) as f32);
            let average = throughput.as_ref().map_or(0.0, |x| x.get() as f64);
            // Progress output is best-effort.
            let _ = write!(stdout, "{}{} {:3}% [{:width$}] {}/{} files {}B/s{}",
                           termion::cursor::Left(!0), spinner, (bar.get() * 100.0) as u32, bar,
                           status.done, status.total, yapb::prefix::Binary(average),
                           termion::clear::UntilNewline,
                           width = width.saturating_sub(45).max(10));
            let _ = stdout.flush();
            spinner.step(1);
        })?
    };
    let status = ctx.status();
    writeln!(stdout, "{}{}compressed {} files in {}s ({} from the archive)",
             termion::cursor::Left(!0), termion::clear::AfterCursor,
             status.done, yapb::prefix::Scientific(seconds(start_time)), status.hits)?;

    let mut output = ctx.assemble(&outputs, image::COMPRESSED_SIZE)?;
    crc::fix(&mut output).context("failed to repair the checksum")?;
    fs::write(&opts.output, &output)
        .with_context(|_| format!("failed to write {}", opts.output.display()))?;
    writeln!(stdout, "wrote {}", opts.output.display())?;

    if archive.is_none() {
        writeln!(stdout, "creating archive {}", opts.archive.display())?;
        Archive::build(&input, &output, &dir)
            .context("failed to collect compressed files")?
            .save(&opts.archive)?;
    }

    Ok(())
}

fn decompress(opts: &Options) -> Result<()> {
    let stdout = io::stdout();
    let mut stdout = stdout.lock();

    let input = image::load(&opts.input, image::COMPRESSED_SIZE)?;
    let dir = Directory::find(&input)
        .with_context(|_| format!("failed to read the file table of {}", opts.input.display()))?;

    let start_time = Instant::now();
    let mut output = pipeline::decompress(&input, &dir, image::DECOMPRESSED_SIZE)?;
    writeln!(stdout, "decompressed {} files in {}s",
             dir.files().len(), yapb::prefix::Scientific(seconds(start_time)))?;

    crc::fix(&mut output).context("failed to repair the checksum")?;
    fs::write(&opts.output, &output)
        .with_context(|_| format!("failed to write {}", opts.output.display()))?;
    writeln!(stdout, "wrote {}", opts.output.display())?;
    Ok(())
}
