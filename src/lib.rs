//! STM32 Serial Bootloader.
//!
//! Based on AN3155
//!
//! [`Programmer`] drives the bootloader protocol over any [`SerialPort`],
//! [`Flasher`] builds flash / verify / erase / dump operations on top of it,
//! and [`image`] decodes the firmware files that feed them.

use core::fmt::{self, Debug};
use core::marker::PhantomData;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};
use thiserror::Error;

pub mod chips;
pub mod flash;
pub mod image;
pub mod monitor;
pub mod protocol;

#[cfg(feature = "linux")]
pub mod linux;

pub use flash::{
    CancelToken, ChannelObserver, EraseMode, FlashError, FlashOptions, FlashPlan, Flasher, Observer, Phase, ProgressEvent,
};
pub use image::{decode, DecodeError, Format, MemorySegment};
pub use monitor::{Mode, ModeGate, Monitor, Monitored, ProtocolGuard};
pub use protocol::{Command, CommandSet, DeviceInfo, EraseKind};

use protocol::*;

/// Handshake attempts before giving up on the bootloader
pub const SYNC_ATTEMPTS: u32 = 4;

/// Most stale bytes discarded before a handshake
const MAX_FLUSH: usize = 4096;

pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    fn set_rts(&mut self, level: bool) -> Result<(), E>;
    fn set_dtr(&mut self, level: bool) -> Result<(), E>;

    /// Gate shared with a monitor reader, if the port has one
    fn gate(&self) -> Option<&ModeGate> {
        None
    }
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum State {
    /// No handshake has completed
    Disconnected,
    /// Handshake complete, device not yet identified
    Synced,
    /// Device identified, [`DeviceInfo`] available
    Ready,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Disconnected => "disconnected",
            State::Synced => "synced",
            State::Ready => "ready",
        };
        f.write_str(s)
    }
}

#[derive(Clone, PartialEq, Debug, Error)]
pub enum Error<SerialError: Debug> {
    #[error("serial error: {0:?}")]
    Serial(SerialError),

    #[error("no response to bootloader handshake after {attempts} attempts")]
    SyncTimeout { attempts: u32 },

    #[error("bootloader rejected {0}")]
    Nack(Command),

    #[error("bootloader rejected write at 0x{address:08x}")]
    WriteRejected { address: u32 },

    #[error("timeout waiting for bootloader response")]
    ProtocolTimeout,

    #[error("unexpected response 0x{0:02x}")]
    InvalidResponse(u8),

    #[error("unknown chip id 0x{0:04x}")]
    UnsupportedDevice(u16),

    #[error("operation not supported by this bootloader: {0}")]
    UnsupportedOperation(&'static str),

    #[error("programmer is {actual}, operation requires {expected}")]
    InvalidState { expected: State, actual: State },

    #[error("invalid length {0}")]
    InvalidLength(usize),
}

impl<SerialError: Debug> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Do not reset the device on connection
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_reset: bool,

    /// Timeout to wait for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1000"))]
    pub response_timeout_ms: u32,

    /// Timeout to wait for a write to be acknowledged
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1000"))]
    pub write_timeout_ms: u32,

    /// Timeout to wait for erase and protection changes to complete
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "60000"))]
    pub erase_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Period to wait for bootloader init before sending init character
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub init_delay_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            no_reset: false,
            response_timeout_ms: 1000,
            write_timeout_ms: 1000,
            erase_timeout_ms: 60_000,
            poll_delay_ms: 1,
            init_delay_ms: 1,
        }
    }
}

pub struct Programmer<P, D, E> {
    state: State,
    info: Option<DeviceInfo>,
    options: Options,
    port: P,
    delay: D,
    _err: PhantomData<E>,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self {
            state: State::Disconnected,
            info: None,
            options,
            port,
            delay,
            _err: PhantomData,
        }
    }

    /// Fetch the programmer state
    pub fn state(&self) -> State {
        self.state
    }

    /// Device information captured by [`Programmer::identify`]
    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.info.as_ref()
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Drop the session and hand back the underlying port
    pub fn release(self) -> P {
        self.port
    }

    /// Synchronise with and identify the bootloader
    pub fn connect(&mut self) -> Result<DeviceInfo, Error<E>> {
        self.sync()?;
        self.identify()
    }

    /// Forget the current session, the device must be re-synchronised
    pub fn disconnect(&mut self) {
        if self.state != State::Disconnected {
            debug!("Closing bootloader session");
        }
        self.end_session();
    }

    fn end_session(&mut self) {
        self.state = State::Disconnected;
        self.info = None;
    }

    /// Pulse DTR / RTS to reset the target into the bootloader
    fn reset(&mut self) -> Result<(), Error<E>> {
        debug!("Resetting device");

        self.port.set_dtr(true)?;
        self.port.set_rts(true)?;

        self.delay.delay_ms(100u32);

        self.port.set_dtr(false)?;
        self.port.set_rts(false)?;

        self.delay.delay_ms(self.options.init_delay_ms);

        Ok(())
    }

    /// Send the discovery character until the bootloader acknowledges it
    pub fn sync(&mut self) -> Result<(), Error<E>> {
        let _guard = self.port.gate().map(ModeGate::acquire);

        self.end_session();

        if !self.options.no_reset {
            self.reset()?;
        }

        self.flush_input()?;

        for attempt in 1..=SYNC_ATTEMPTS {
            debug!("Sending discovery character (attempt {})", attempt);
            self.send(&[UART_DISC])?;

            match self.await_ack(Command::Get, self.options.response_timeout_ms) {
                Ok(()) => {
                    debug!("Bootloader synchronised");
                    self.state = State::Synced;
                    return Ok(());
                }
                Err(Error::Serial(e)) => return Err(Error::Serial(e)),
                Err(e) => debug!("Discovery attempt {} failed: {}", attempt, e),
            }
        }

        error!("Bootloader did not respond to discovery");
        Err(Error::SyncTimeout { attempts: SYNC_ATTEMPTS })
    }

    /// Run `Get`, `GetVersion` and `GetId` and cache the result.
    ///
    /// An unknown chip ID still completes the session (the info is cached
    /// and the programmer is `Ready`) but is reported as `UnsupportedDevice`.
    pub fn identify(&mut self) -> Result<DeviceInfo, Error<E>> {
        let _guard = self.port.gate().map(ModeGate::acquire);
        self.require(State::Synced)?;

        let (bootloader_version, commands) = self.get()?;
        let (_, option_bytes) = self.get_version()?;
        let chip_id = self.get_id()?;

        let info = DeviceInfo { bootloader_version, chip_id, commands, option_bytes };
        let (major, minor) = info.version();
        info!(
            "Found {} (0x{:03x}), bootloader v{}.{}",
            info.chip_name(),
            chip_id,
            major,
            minor
        );

        self.info = Some(info.clone());
        self.state = State::Ready;

        if info.chip().is_none() {
            warn!("Unknown chip id 0x{:04x}, using generic behaviour", chip_id);
            return Err(Error::UnsupportedDevice(chip_id));
        }

        Ok(info)
    }

    /// Fetch the bootloader version and supported commands
    pub fn get(&mut self) -> Result<(u8, CommandSet), Error<E>> {
        let _guard = self.port.gate().map(ModeGate::acquire);
        self.require(State::Synced)?;

        self.send_command(Command::Get)?;

        let n = self.read_byte()? as usize;
        let version = self.read_byte()?;
        let raw = self.read_bytes(n)?;

        self.await_ack(Command::Get, self.options.response_timeout_ms)?;

        let commands = CommandSet::from_bytes(&raw);
        debug!("Bootloader v0x{:02x} commands: {:02x?}", version, raw);

        Ok((version, commands))
    }

    /// Fetch the bootloader version and the two option bytes
    pub fn get_version(&mut self) -> Result<(u8, [u8; 2]), Error<E>> {
        let _guard = self.port.gate().map(ModeGate::acquire);
        self.require(State::Synced)?;

        self.send_command(Command::GetVersionReadStatus)?;

        let version = self.read_byte()?;
        let option_bytes = [self.read_byte()?, self.read_byte()?];

        self.await_ack(Command::GetVersionReadStatus, self.options.response_timeout_ms)?;

        Ok((version, option_bytes))
    }

    /// Fetch the chip product ID
    pub fn get_id(&mut self) -> Result<u16, Error<E>> {
        let _guard = self.port.gate().map(ModeGate::acquire);
        self.require(State::Synced)?;

        self.send_command(Command::GetId)?;

        let n = self.read_byte()? as usize + 1;
        let id = self.read_bytes(n)?;

        self.await_ack(Command::GetId, self.options.response_timeout_ms)?;

        let pid = match id.as_slice() {
            [hi, lo, ..] => u16::from_be_bytes([*hi, *lo]),
            [lo] => *lo as u16,
            [] => return Err(Error::InvalidLength(0)),
        };

        Ok(pid)
    }

    /// Read `len` (1..=256) bytes starting at `address`
    pub fn read_memory(&mut self, address: u32, len: usize) -> Result<Vec<u8>, Error<E>> {
        let _guard = self.port.gate().map(ModeGate::acquire);
        self.require(State::Synced)?;
        self.require_command(Command::ReadMemory)?;

        if len == 0 || len > MAX_CHUNK {
            return Err(Error::InvalidLength(len));
        }

        trace!("Reading {} bytes from 0x{:08x}", len, address);

        self.send_command(Command::ReadMemory)?;
        self.send_address(Command::ReadMemory, address)?;

        self.send(&length_frame(len))?;
        self.await_ack(Command::ReadMemory, self.options.response_timeout_ms)?;

        self.read_bytes(len)
    }

    /// Write up to 256 bytes at `address`.
    ///
    /// Data is padded with 0xFF to a multiple of four bytes. A rejected write
    /// is reported as `WriteRejected` and never re-sent.
    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), Error<E>> {
        let _guard = self.port.gate().map(ModeGate::acquire);
        self.require(State::Synced)?;
        self.require_command(Command::WriteMemory)?;

        if data.is_empty() || data.len() > MAX_CHUNK {
            return Err(Error::InvalidLength(data.len()));
        }

        if address % 4 != 0 {
            warn!("Write address 0x{:08x} is not word aligned", address);
        }

        let mut payload = data.to_vec();
        while payload.len() % 4 != 0 {
            payload.push(0xFF);
        }

        trace!("Writing {} bytes to 0x{:08x}", payload.len(), address);

        self.send_command(Command::WriteMemory)?;
        self.send_address(Command::WriteMemory, address)?;

        self.send(&data_frame(&payload))?;
        match self.await_ack(Command::WriteMemory, self.options.write_timeout_ms) {
            Err(Error::Nack(_)) => {
                error!("Write rejected at 0x{:08x}", address);
                Err(Error::WriteRejected { address })
            }
            r => r,
        }
    }

    /// Erase flash using whichever erase command the bootloader advertises.
    ///
    /// Legacy (0x43) bootloaders only support a global erase here.
    pub fn erase(&mut self, kind: &EraseKind) -> Result<(), Error<E>> {
        let _guard = self.port.gate().map(ModeGate::acquire);
        self.require(State::Ready)?;

        let commands = self.info.as_ref().map(|i| i.commands.clone()).unwrap_or_default();

        if commands.extended_erase() {
            if let EraseKind::Pages(pages) = kind {
                if pages.is_empty() || pages.len() > EXT_ERASE_MAX_PAGES {
                    return Err(Error::InvalidLength(pages.len()));
                }
            }

            debug!("Extended erase: {:?}", kind);

            self.send_command(Command::ExtendedErase)?;
            self.send(&extended_erase_frame(kind))?;
            self.await_ack(Command::ExtendedErase, self.options.erase_timeout_ms)
        } else if commands.supports(Command::Erase) {
            match kind {
                EraseKind::Global => (),
                EraseKind::Pages(_) => return Err(Error::UnsupportedOperation("page erase on legacy bootloader")),
                _ => return Err(Error::UnsupportedOperation("bank erase on legacy bootloader")),
            }

            debug!("Legacy global erase");

            self.send_command(Command::Erase)?;
            self.send(&erase_frame())?;
            self.await_ack(Command::Erase, self.options.erase_timeout_ms)
        } else {
            Err(Error::UnsupportedOperation("erase"))
        }
    }

    /// Jump to the application at `address`, ending the bootloader session
    pub fn go(&mut self, address: u32) -> Result<(), Error<E>> {
        let _guard = self.port.gate().map(ModeGate::acquire);
        self.require(State::Synced)?;
        self.require_command(Command::Go)?;

        info!("Jumping to 0x{:08x}", address);

        self.send_command(Command::Go)?;
        self.send_address(Command::Go, address)?;

        // the bootloader is no longer listening
        self.end_session();

        Ok(())
    }

    /// Enable write protection for `sectors`, or remove it from all sectors.
    ///
    /// The device resets once the option bytes are rewritten, ending the session.
    pub fn write_protect(&mut self, enable: bool, sectors: &[u8]) -> Result<(), Error<E>> {
        let _guard = self.port.gate().map(ModeGate::acquire);
        self.require(State::Ready)?;

        if enable {
            self.require_command(Command::WriteProtect)?;
            if sectors.is_empty() || sectors.len() > MAX_CHUNK {
                return Err(Error::InvalidLength(sectors.len()));
            }

            self.send_command(Command::WriteProtect)?;
            self.send(&sector_frame(sectors))?;
            self.await_ack(Command::WriteProtect, self.options.erase_timeout_ms)?;
        } else {
            self.require_command(Command::WriteUnprotect)?;

            self.send_command(Command::WriteUnprotect)?;
            self.await_ack(Command::WriteUnprotect, self.options.erase_timeout_ms)?;
        }

        info!("Write protection {}, device resetting", if enable { "enabled" } else { "removed" });
        self.end_session();

        Ok(())
    }

    /// Enable readout protection, the device resets afterwards
    pub fn readout_protect(&mut self) -> Result<(), Error<E>> {
        self.protection_command(Command::ReadoutProtect)
    }

    /// Remove readout protection. This mass-erases flash and resets the device.
    pub fn readout_unprotect(&mut self) -> Result<(), Error<E>> {
        self.protection_command(Command::ReadoutUnprotect)
    }

    fn protection_command(&mut self, command: Command) -> Result<(), Error<E>> {
        let _guard = self.port.gate().map(ModeGate::acquire);
        self.require(State::Ready)?;
        self.require_command(command)?;

        self.send_command(command)?;
        self.await_ack(command, self.options.erase_timeout_ms)?;

        info!("{} complete, device resetting", command.name());
        self.end_session();

        Ok(())
    }

    fn require(&self, minimum: State) -> Result<(), Error<E>> {
        if self.state < minimum {
            return Err(Error::InvalidState { expected: minimum, actual: self.state });
        }
        Ok(())
    }

    /// Reject commands the identified device does not advertise
    fn require_command(&self, command: Command) -> Result<(), Error<E>> {
        match &self.info {
            Some(info) if !info.commands.supports(command) => Err(Error::UnsupportedOperation(command.name())),
            _ => Ok(()),
        }
    }

    fn send(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        for b in data {
            block!(self.port.write(*b))?;
        }
        Ok(())
    }

    fn send_command(&mut self, command: Command) -> Result<(), Error<E>> {
        trace!("Sending command {}", command);
        self.send(&command_frame(command))?;
        self.await_ack(command, self.options.response_timeout_ms)
    }

    fn send_address(&mut self, command: Command, address: u32) -> Result<(), Error<E>> {
        self.send(&address_frame(address))?;
        self.await_ack(command, self.options.response_timeout_ms)
    }

    /// Poll for a single byte, giving up after `timeout_ms`
    fn poll_byte(&mut self, timeout_ms: u32) -> Result<u8, Error<E>> {
        let mut t = 0;

        loop {
            // Attempt to read from serial port
            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(e.into()),
                Ok(v) => return Ok(v),
            };

            // Wait for delay period
            self.delay.delay_ms(self.options.poll_delay_ms);
            t += self.options.poll_delay_ms.max(1);

            if t > timeout_ms {
                return Err(Error::ProtocolTimeout);
            }
        }
    }

    /// Discard anything already waiting on the receive side
    fn flush_input(&mut self) -> Result<(), Error<E>> {
        let mut discarded = 0;

        while discarded < MAX_FLUSH {
            match self.port.read() {
                Ok(_) => discarded += 1,
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => return Err(e.into()),
            }
        }

        if discarded > 0 {
            trace!("Discarded {} stale bytes", discarded);
        }

        Ok(())
    }

    fn read_byte(&mut self) -> Result<u8, Error<E>> {
        self.poll_byte(self.options.response_timeout_ms)
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>, Error<E>> {
        let mut data = Vec::with_capacity(len);
        for _ in 0..len {
            data.push(self.read_byte()?);
        }
        Ok(data)
    }

    fn await_ack(&mut self, command: Command, timeout_ms: u32) -> Result<(), Error<E>> {
        match self.poll_byte(timeout_ms) {
            Ok(UART_ACK) => {
                trace!("Received bootloader ack");
                Ok(())
            }
            Ok(UART_NACK) => {
                debug!("Received bootloader nack for {}", command);
                Err(Error::Nack(command))
            }
            Ok(v) => {
                debug!("Received unexpected value: 0x{:x}", v);
                Err(Error::InvalidResponse(v))
            }
            Err(Error::ProtocolTimeout) => {
                error!("Receive timeout");
                Err(Error::ProtocolTimeout)
            }
            Err(e) => Err(e),
        }
    }
}
