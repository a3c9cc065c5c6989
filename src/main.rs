#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::fs;
use std::io::{ErrorKind as IoErrorKind, Write as _};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use indicatif::{ProgressBar, ProgressStyle};
use linux_embedded_hal::{Delay, Serial};

use stm32_uart_loader::image::{encode_ihex, image_size};
use stm32_uart_loader::linux::{self, list_ports};
use stm32_uart_loader::protocol::FLASH_BASE;
use stm32_uart_loader::{
    decode, DeviceInfo, EraseKind, EraseMode, Error, FlashOptions, Flasher, Format, MemorySegment, Monitor,
    Monitored, Options, Phase, Programmer, ProgressEvent, SerialPort,
};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    #[structopt(subcommand)]
    operation: Operation,

    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "57600")]
    baud: usize,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Operation {
    /// List available serial ports
    ListPorts,

    /// Connect and display chip information
    Info,

    /// Write a firmware image (Intel HEX or binary) to flash
    Flash {
        file: PathBuf,

        /// Load address for binary images
        #[structopt(long, parse(try_from_str = parse_number))]
        address: Option<u32>,

        /// Do not erase before writing
        #[structopt(long)]
        no_erase: bool,

        /// Erase only the pages covered by the image
        #[structopt(long, conflicts_with = "no-erase")]
        page_erase: bool,

        /// Flash page size, for devices without uniform pages
        #[structopt(long, parse(try_from_str = parse_number))]
        page_size: Option<u32>,

        /// Do not read back and compare after writing
        #[structopt(long)]
        no_verify: bool,

        /// Do not start the application after writing
        #[structopt(long)]
        no_run: bool,
    },

    /// Compare flash contents against a firmware image
    Verify {
        file: PathBuf,

        /// Load address for binary images
        #[structopt(long, parse(try_from_str = parse_number))]
        address: Option<u32>,
    },

    /// Erase the whole flash
    Erase,

    /// Read device memory
    Read {
        #[structopt(parse(try_from_str = parse_number))]
        address: u32,

        #[structopt(parse(try_from_str = parse_number))]
        length: u32,

        /// Output file, written as Intel HEX for `.hex` paths and raw binary otherwise
        #[structopt(long, short)]
        output: Option<PathBuf>,
    },

    /// Jump to an application
    Go {
        #[structopt(parse(try_from_str = parse_number))]
        address: u32,
    },

    /// Display serial output from the device
    Monitor {
        /// Print received bytes as hex
        #[structopt(long)]
        hex: bool,

        /// Identify the bootloader before monitoring
        #[structopt(long)]
        identify: bool,
    },
}

/// Parse a decimal or 0x-prefixed hex number
fn parse_number(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(h) => u32::from_str_radix(h, 16),
        None => s.parse(),
    }
}

type Loader<P> = Programmer<P, Delay, IoErrorKind>;

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    if let Err(e) = run(o) {
        error!("{:?}", e);
        std::process::exit(1);
    }
}

fn run(o: Args) -> anyhow::Result<()> {
    match o.operation.clone() {
        Operation::ListPorts => {
            let ports = list_ports().context("Error listing serial ports")?;
            if ports.is_empty() {
                info!("No serial ports found");
            }
            for p in ports {
                info!("{} ({})", p.path.display(), p.driver.as_deref().unwrap_or("unknown driver"));
            }
            Ok(())
        }
        Operation::Monitor { hex, identify } => monitor(&o, hex, identify),
        op => {
            info!("Connecting to serial port");

            let mut p = Programmer::linux(&o.port, o.baud, o.options.clone())
                .with_context(|| format!("Error connecting to serial port {}", o.port))?;

            info!("Connecting to bootloader");
            let info = connect(&mut p)?;

            execute(&mut p, &info, op)
        }
    }
}

fn execute<P: SerialPort<IoErrorKind>>(p: &mut Loader<P>, info: &DeviceInfo, op: Operation) -> anyhow::Result<()> {
    match op {
        Operation::Info => print_info(info),
        Operation::Flash { file, address, no_erase, page_erase, page_size, no_verify, no_run } => {
            let segments = load(&file, address)?;

            let erase = match (no_erase, page_erase) {
                (true, _) => EraseMode::Skip,
                (false, true) => EraseMode::Pages,
                (false, false) => EraseMode::Global,
            };
            let options = FlashOptions { erase, verify: !no_verify, run: !no_run, page_size };

            let bar = progress_bar();
            Flasher::new(p)
                .with_observer(|e: ProgressEvent| update(&bar, e))
                .flash(&segments, &options)
                .with_context(|| format!("Error flashing {}", file.display()))?;
            bar.finish_and_clear();

            info!("Flashed {}", bytefmt::format(image_size(&segments) as u64));
        }
        Operation::Verify { file, address } => {
            let segments = load(&file, address)?;

            let bar = progress_bar();
            Flasher::new(p)
                .with_observer(|e: ProgressEvent| update(&bar, e))
                .verify(&segments)
                .with_context(|| format!("Error verifying {}", file.display()))?;
            bar.finish_and_clear();

            info!("Verify OK");
        }
        Operation::Erase => {
            Flasher::new(p).erase(&EraseKind::Global).context("Error erasing flash")?;
            info!("Flash erased");
        }
        Operation::Read { address, length, output } => {
            let bar = progress_bar();
            let data = Flasher::new(p)
                .with_observer(|e: ProgressEvent| update(&bar, e))
                .read_memory_dump(address, length)
                .with_context(|| format!("Error reading {} bytes at 0x{:08x}", length, address))?;
            bar.finish_and_clear();

            match output {
                Some(path) => write_dump(&path, address, data)?,
                None => {
                    for (i, row) in data.chunks(16).enumerate() {
                        info!("{:08x}: {}", address as usize + i * 16, hex::encode(row));
                    }
                }
            }
        }
        Operation::Go { address } => {
            p.go(address).with_context(|| format!("Error jumping to 0x{:08x}", address))?;
        }
        Operation::ListPorts | Operation::Monitor { .. } => {
            return Err(anyhow!("{:?} does not use a bootloader session", op));
        }
    }

    Ok(())
}

/// Sync and identify, accepting unknown chips with a warning
fn connect<P: SerialPort<IoErrorKind>>(p: &mut Loader<P>) -> anyhow::Result<DeviceInfo> {
    match p.connect() {
        Ok(info) => Ok(info),
        Err(Error::UnsupportedDevice(id)) => {
            warn!("Continuing with unknown chip 0x{:04x}", id);
            p.device_info().cloned().ok_or_else(|| anyhow!("Missing device info"))
        }
        Err(e) => Err(e).context("Error connecting to bootloader"),
    }
}

fn print_info(info: &DeviceInfo) {
    let (major, minor) = info.version();
    let page = info.chip().and_then(|c| c.page_size);

    info!("Chip:        {} (0x{:03x})", info.chip_name(), info.chip_id);
    info!("Bootloader:  v{}.{}", major, minor);
    info!("Option bytes: {:02x?}", info.option_bytes);
    info!("Ext. erase:  {}", if info.commands.extended_erase() { "yes" } else { "no" });
    if let Some(p) = page {
        info!("Page size:   {}", bytefmt::format(p as u64));
    }

    let names: Vec<_> = info.commands.iter().map(|c| c.name()).collect();
    info!("Commands:    {}", names.join(" "));
}

fn load(file: &Path, address: Option<u32>) -> anyhow::Result<Vec<MemorySegment>> {
    let format = Format::from_path(file).unwrap_or_else(|| {
        warn!("Unknown extension for {}, loading as binary", file.display());
        Format::Binary
    });

    let bytes = fs::read(file).with_context(|| format!("Error reading {}", file.display()))?;
    let segments = decode(&bytes, format, address.unwrap_or(FLASH_BASE))
        .with_context(|| format!("Error decoding {}", file.display()))?;

    for s in &segments {
        debug!("Segment 0x{:08x} {}", s.address, bytefmt::format(s.data.len() as u64));
    }

    Ok(segments)
}

fn write_dump(path: &Path, address: u32, data: Vec<u8>) -> anyhow::Result<()> {
    let out = match Format::from_path(path) {
        Some(Format::IntelHex) => encode_ihex(&[MemorySegment::new(address, data)]).into_bytes(),
        _ => data,
    };

    fs::write(path, &out).with_context(|| format!("Error writing {}", path.display()))?;
    info!("Wrote {} to {}", bytefmt::format(out.len() as u64), path.display());

    Ok(())
}

fn monitor(o: &Args, hex: bool, identify: bool) -> anyhow::Result<()> {
    let port = linux::open(&o.port, o.baud).with_context(|| format!("Error opening serial port {}", o.port))?;
    let shared: Monitored<Serial> = Monitored::new(port);

    let (tx, rx) = crossbeam_channel::unbounded();
    let _monitor = Monitor::spawn(shared.clone(), tx);

    if identify {
        let mut p = Programmer::new(shared, Delay {}, o.options.clone());
        print_info(&connect(&mut p)?);
    }

    info!("Monitoring {} (ctrl-c to exit)", o.port);

    let stdout = std::io::stdout();
    for data in rx {
        let mut out = stdout.lock();
        if hex {
            writeln!(out, "{}", hex::encode(&data))?;
        } else {
            out.write_all(&data)?;
        }
        out.flush()?;
    }

    Ok(())
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(0);
    bar.set_style(ProgressStyle::default_bar().template("{msg:8} [{bar:40}] {pos}/{len}").progress_chars("=> "));
    bar
}

fn update(bar: &ProgressBar, e: ProgressEvent) {
    if e.bytes_done == 0 {
        let msg = match e.phase {
            Phase::Erase => "erase",
            Phase::Write => "write",
            Phase::Verify => "verify",
            Phase::Read => "read",
        };
        bar.set_message(msg);
        bar.set_length(e.bytes_total as u64);
    }
    bar.set_position(e.bytes_done as u64);
}
