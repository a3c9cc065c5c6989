//! AN3155 wire constants, command identifiers and frame builders.

use core::convert::TryFrom;
use core::fmt;

use crate::chips::{self, Chip};

pub const UART_DISC: u8 = 0x7F;

pub const UART_ACK: u8 = 0x79;
pub const UART_NACK: u8 = 0x1F;

/// Largest payload accepted by a single ReadMemory / WriteMemory exchange
pub const MAX_CHUNK: usize = 256;

/// Chunk size used while the device has not been identified
pub const DEFAULT_CHUNK: usize = 128;

/// Start of user flash on every STM32 family
pub const FLASH_BASE: u32 = 0x0800_0000;

/// Extended erase special codes
pub const EXT_ERASE_GLOBAL: u16 = 0xFFFF;
pub const EXT_ERASE_BANK1: u16 = 0xFFFE;
pub const EXT_ERASE_BANK2: u16 = 0xFFFD;

/// Page counts from 0xFFF0 upwards are reserved for special erase codes
pub const EXT_ERASE_MAX_PAGES: usize = 0xFFF0;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Command {
    /// Fetch bootloader version and allowed commands
    Get = 0x00,

    /// Gets the bootloader version and the Read Protection status of the Flash memory.
    GetVersionReadStatus = 0x01,

    /// Gets the chip ID
    GetId = 0x02,

    /// Reads up to 256 bytes of memory starting from an address specified by the application.
    ReadMemory = 0x11,

    /// Jumps to user application code located in the internal Flash memory or in the SRAM.
    Go = 0x21,

    /// Writes up to 256 bytes to the RAM or Flash memory starting from an address specified by the application.
    WriteMemory = 0x31,

    /// Erases from one to all the Flash memory pages.
    Erase = 0x43,

    /// Erases from one to all the Flash memory pages using two byte addressing mode (available only for v3.0 USART bootloader versions and above).
    ExtendedErase = 0x44,

    /// Enables the write protection for some sectors.
    WriteProtect = 0x63,

    /// Disables the write protection for all Flash memory sectors
    WriteUnprotect = 0x73,

    /// Enables the read protection
    ReadoutProtect = 0x82,

    /// Disables the read protection.
    ReadoutUnprotect = 0x92,
}

impl Command {
    pub const ALL: [Command; 12] = [
        Command::Get,
        Command::GetVersionReadStatus,
        Command::GetId,
        Command::ReadMemory,
        Command::Go,
        Command::WriteMemory,
        Command::Erase,
        Command::ExtendedErase,
        Command::WriteProtect,
        Command::WriteUnprotect,
        Command::ReadoutProtect,
        Command::ReadoutUnprotect,
    ];

    /// Short mnemonic used in logs and chip summaries
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get => "GET",
            Command::GetVersionReadStatus => "GET_VER",
            Command::GetId => "GET_ID",
            Command::ReadMemory => "READ",
            Command::Go => "GO",
            Command::WriteMemory => "WRITE",
            Command::Erase => "ERASE",
            Command::ExtendedErase => "EXT_ERASE",
            Command::WriteProtect => "WP",
            Command::WriteUnprotect => "WP_UN",
            Command::ReadoutProtect => "RP",
            Command::ReadoutUnprotect => "RP_UN",
        }
    }
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Command::ALL.iter().copied().find(|c| *c as u8 == v).ok_or(v)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02x})", self.name(), *self as u8)
    }
}

/// Erase request, translated to the legacy or extended erase frame
/// depending on what the bootloader advertises
#[derive(Clone, Debug, PartialEq)]
pub enum EraseKind {
    Global,
    Pages(Vec<u16>),
    Bank1,
    Bank2,
}

impl EraseKind {
    /// Number of units reported as erase progress
    pub fn units(&self) -> u32 {
        match self {
            EraseKind::Pages(p) => p.len() as u32,
            _ => 1,
        }
    }
}

/// Commands advertised by the bootloader in response to `Get`
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommandSet {
    raw: Vec<u8>,
}

impl CommandSet {
    pub fn from_bytes(raw: &[u8]) -> Self {
        Self { raw: raw.to_vec() }
    }

    pub fn supports(&self, command: Command) -> bool {
        self.raw.contains(&(command as u8))
    }

    /// Bootloader uses 16-bit page numbers (v3.0 and later)
    pub fn extended_erase(&self) -> bool {
        self.supports(Command::ExtendedErase)
    }

    /// Known commands, in advertised order
    pub fn iter(&self) -> impl Iterator<Item = Command> + '_ {
        self.raw.iter().filter_map(|c| Command::try_from(*c).ok())
    }

    /// Raw command bytes including any the crate does not know about
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

/// Identity of the connected device, captured once per session
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceInfo {
    pub bootloader_version: u8,
    pub chip_id: u16,
    pub commands: CommandSet,
    pub option_bytes: [u8; 2],
}

impl DeviceInfo {
    /// Bootloader version as (major, minor)
    pub fn version(&self) -> (u8, u8) {
        (self.bootloader_version >> 4, self.bootloader_version & 0x0F)
    }

    pub fn chip(&self) -> Option<&'static Chip> {
        chips::lookup(self.chip_id)
    }

    pub fn chip_name(&self) -> &'static str {
        self.chip().map(|c| c.name).unwrap_or("Unknown")
    }

    /// Largest ReadMemory payload for this device
    pub fn max_read(&self) -> usize {
        MAX_CHUNK
    }

    /// Largest WriteMemory payload for this device
    pub fn max_write(&self) -> usize {
        MAX_CHUNK
    }
}

/// XOR of all bytes
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Command byte followed by its complement
pub fn command_frame(command: Command) -> [u8; 2] {
    let c = command as u8;
    [c, c ^ 0xFF]
}

/// Big-endian address followed by the XOR of its bytes
pub fn address_frame(address: u32) -> [u8; 5] {
    let a = address.to_be_bytes();
    [a[0], a[1], a[2], a[3], checksum(&a)]
}

/// ReadMemory length byte (`N-1`) followed by its complement
pub fn length_frame(len: usize) -> [u8; 2] {
    let n = (len - 1) as u8;
    [n, n ^ 0xFF]
}

/// WriteMemory payload: `N-1`, data, XOR of both
pub fn data_frame(data: &[u8]) -> Vec<u8> {
    let n = (data.len() - 1) as u8;

    let mut frame = Vec::with_capacity(data.len() + 2);
    frame.push(n);
    frame.extend_from_slice(data);
    frame.push(checksum(&frame));

    frame
}

/// Legacy (0x43) global erase
pub fn erase_frame() -> [u8; 2] {
    [0xFF, 0x00]
}

/// Extended (0x44) erase payload for the given request
pub fn extended_erase_frame(kind: &EraseKind) -> Vec<u8> {
    let mut frame = Vec::new();

    match kind {
        EraseKind::Global => frame.extend_from_slice(&EXT_ERASE_GLOBAL.to_be_bytes()),
        EraseKind::Bank1 => frame.extend_from_slice(&EXT_ERASE_BANK1.to_be_bytes()),
        EraseKind::Bank2 => frame.extend_from_slice(&EXT_ERASE_BANK2.to_be_bytes()),
        EraseKind::Pages(pages) => {
            frame.extend_from_slice(&((pages.len() - 1) as u16).to_be_bytes());
            for p in pages {
                frame.extend_from_slice(&p.to_be_bytes());
            }
        }
    }

    let c = checksum(&frame);
    frame.push(c);
    frame
}

/// WriteProtect sector list: `N-1`, sector codes, XOR of both
pub fn sector_frame(sectors: &[u8]) -> Vec<u8> {
    data_frame(sectors)
}
