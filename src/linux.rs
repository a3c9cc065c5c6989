use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use linux_embedded_hal::{Delay, Serial};
use serial_core::{
    BaudRate, CharSize, Error as SerialError, ErrorKind as SerialErrorKind, FlowControl, Parity,
    SerialDevice as _, SerialPortSettings as _, StopBits,
};

use crate::{Options, Programmer, SerialPort};

/// Read timeout applied to the port, reads past this poll as `WouldBlock`
const READ_TIMEOUT: Duration = Duration::from_millis(1);

fn io_kind(e: SerialError) -> IoErrorKind {
    match e.kind() {
        SerialErrorKind::Io(k) => k,
        SerialErrorKind::NoDevice => IoErrorKind::NotFound,
        SerialErrorKind::InvalidInput => IoErrorKind::InvalidInput,
    }
}

impl SerialPort<IoErrorKind> for Serial {
    fn set_rts(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_rts(level).map_err(io_kind)
    }
    fn set_dtr(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_dtr(level).map_err(io_kind)
    }
}

/// Open a serial port configured for the bootloader (8E1, no flow control)
pub fn open<P: AsRef<Path>>(port: P, baud: usize) -> Result<Serial, SerialError> {
    debug!("Opening {} at {} baud", port.as_ref().display(), baud);

    // Open port
    let mut port = Serial::open(port.as_ref())?;

    // Apply settings
    let mut settings = port.0.read_settings()?;

    settings.set_char_size(CharSize::Bits8);
    settings.set_stop_bits(StopBits::Stop1);
    settings.set_baud_rate(BaudRate::from_speed(baud))?;
    settings.set_flow_control(FlowControl::FlowNone);
    settings.set_parity(Parity::ParityEven);

    port.0.write_settings(&settings)?;
    port.0.set_timeout(READ_TIMEOUT)?;

    Ok(port)
}

impl Programmer<Serial, Delay, IoErrorKind> {
    /// Create a new linux serial port programmer instance
    pub fn linux<P: AsRef<Path>>(port: P, baud: usize, options: Options) -> Result<Self, SerialError> {
        let port = open(port, baud)?;

        // Return instance
        Ok(Self::new(port, Delay {}, options))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PortInfo {
    pub path: PathBuf,
    pub driver: Option<String>,
}

/// List serial ports backed by a device driver
pub fn list_ports() -> std::io::Result<Vec<PortInfo>> {
    let mut ports = Vec::new();

    for entry in fs::read_dir("/sys/class/tty")? {
        let entry = entry?;
        let device = entry.path().join("device");

        // virtual terminals have no backing device
        if !device.exists() {
            continue;
        }

        let driver = fs::read_link(device.join("driver"))
            .ok()
            .and_then(|d| d.file_name().map(|n| n.to_string_lossy().into_owned()));

        // legacy 8250 ports are always listed whether or not hardware is present
        if driver.as_deref() == Some("serial8250") {
            continue;
        }

        ports.push(PortInfo { path: Path::new("/dev").join(entry.file_name()), driver });
    }

    ports.sort_by(|a, b| a.path.cmp(&b.path));

    Ok(ports)
}
