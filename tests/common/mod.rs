//! Simulated STM32 bootloader speaking AN3155 over an in-memory port.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use embedded_hal::serial::{Read, Write};
use embedded_hal_mock::delay::MockNoop;

use stm32_uart_loader::protocol::{checksum, FLASH_BASE, UART_ACK, UART_DISC, UART_NACK};
use stm32_uart_loader::{EraseKind, Options, Programmer, SerialPort};

pub const FLASH_SIZE: usize = 64 * 1024;
pub const PAGE_SIZE: usize = 1024;

#[derive(Clone, Debug, PartialEq)]
pub struct SimError;

#[derive(Clone, Debug)]
pub struct SimConfig {
    pub commands: Vec<u8>,
    pub version: u8,
    pub chip_id: u16,
    /// NACK this many discovery bytes before acknowledging
    pub sync_nacks: usize,
    /// NACK the write data stage of the n-th write (0 based)
    pub nack_write: Option<usize>,
    /// Bytes the application has printed before the test starts
    pub idle_output: Vec<u8>,
}

impl SimConfig {
    /// v3.1 bootloader with extended erase on an F1 medium density part
    pub fn extended() -> Self {
        Self {
            commands: vec![0x00, 0x01, 0x02, 0x11, 0x21, 0x31, 0x44, 0x63, 0x73, 0x82, 0x92],
            version: 0x31,
            chip_id: 0x410,
            sync_nacks: 0,
            nack_write: None,
            idle_output: vec![],
        }
    }

    /// v2.2 bootloader with the one byte erase command
    pub fn legacy() -> Self {
        Self {
            commands: vec![0x00, 0x01, 0x02, 0x11, 0x21, 0x31, 0x43, 0x63, 0x73, 0x82, 0x92],
            version: 0x22,
            ..Self::extended()
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Stage {
    Idle,
    Address(u8),
    ReadLength(u32),
    WriteData(u32),
    Erase,
    ExtendedErase,
}

#[derive(Debug)]
pub struct Sim {
    config: SimConfig,
    synced: bool,
    stage: Stage,
    pending: Vec<u8>,
    rx: VecDeque<u8>,
    flash: Vec<u8>,

    pub writes: Vec<(u32, usize)>,
    pub write_attempts: usize,
    pub reads: Vec<(u32, usize)>,
    pub erases: Vec<EraseKind>,
    pub jumped: Option<u32>,
}

impl Sim {
    fn new(config: SimConfig) -> Self {
        Self {
            rx: config.idle_output.iter().copied().collect(),
            config,
            synced: false,
            stage: Stage::Idle,
            pending: vec![],
            flash: vec![0xFF; FLASH_SIZE],
            writes: vec![],
            write_attempts: 0,
            reads: vec![],
            erases: vec![],
            jumped: None,
        }
    }

    fn reply(&mut self, data: &[u8]) {
        self.rx.extend(data.iter().copied());
    }

    fn offset(&self, address: u32, len: usize) -> Option<usize> {
        let start = address.checked_sub(FLASH_BASE)? as usize;
        if start + len <= FLASH_SIZE {
            Some(start)
        } else {
            None
        }
    }

    fn done(&mut self, response: u8) {
        self.pending.clear();
        self.stage = Stage::Idle;
        self.reply(&[response]);
    }

    fn receive(&mut self, b: u8) {
        if !self.synced {
            if b == UART_DISC {
                if self.config.sync_nacks > 0 {
                    self.config.sync_nacks -= 1;
                    self.reply(&[UART_NACK]);
                } else {
                    self.synced = true;
                    self.reply(&[UART_ACK]);
                }
            }
            return;
        }

        self.pending.push(b);
        let p = self.pending.clone();

        match self.stage {
            Stage::Idle if p.len() == 2 => {
                self.pending.clear();
                if p[0] ^ p[1] != 0xFF || !self.config.commands.contains(&p[0]) {
                    self.reply(&[UART_NACK]);
                    return;
                }
                self.command(p[0]);
            }
            Stage::Address(c) if p.len() == 5 => {
                let address = u32::from_be_bytes([p[0], p[1], p[2], p[3]]);
                if checksum(&p[..4]) != p[4] || self.offset(address, 1).is_none() {
                    return self.done(UART_NACK);
                }

                self.pending.clear();
                self.reply(&[UART_ACK]);

                self.stage = match c {
                    0x11 => Stage::ReadLength(address),
                    0x31 => Stage::WriteData(address),
                    _ => {
                        self.jumped = Some(address);
                        self.synced = false;
                        Stage::Idle
                    }
                };
            }
            Stage::ReadLength(address) if p.len() == 2 => {
                let len = p[0] as usize + 1;
                let start = match self.offset(address, len) {
                    Some(s) if p[0] ^ p[1] == 0xFF => s,
                    _ => return self.done(UART_NACK),
                };

                self.done(UART_ACK);
                let data = self.flash[start..start + len].to_vec();
                self.reply(&data);
                self.reads.push((address, len));
            }
            Stage::WriteData(address) if p.len() == p[0] as usize + 3 => {
                let data = &p[1..p.len() - 1];
                let attempt = self.write_attempts;
                self.write_attempts += 1;

                let start = match self.offset(address, data.len()) {
                    Some(s) if checksum(&p[..p.len() - 1]) == p[p.len() - 1] => s,
                    _ => return self.done(UART_NACK),
                };
                if self.config.nack_write == Some(attempt) {
                    return self.done(UART_NACK);
                }

                self.flash[start..start + data.len()].copy_from_slice(data);
                self.writes.push((address, data.len()));
                self.done(UART_ACK);
            }
            Stage::Erase if p.len() == 2 => {
                if p != [0xFF, 0x00] {
                    return self.done(UART_NACK);
                }
                self.erase(EraseKind::Global);
                self.done(UART_ACK);
            }
            Stage::ExtendedErase if p.len() >= 3 => {
                let n = u16::from_be_bytes([p[0], p[1]]);
                let kind = match n {
                    0xFFFF => EraseKind::Global,
                    0xFFFE => EraseKind::Bank1,
                    0xFFFD => EraseKind::Bank2,
                    _ if p.len() == 2 + (n as usize + 1) * 2 + 1 => {
                        EraseKind::Pages(p[2..p.len() - 1].chunks(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect())
                    }
                    _ => return,
                };

                if checksum(&p[..p.len() - 1]) != p[p.len() - 1] {
                    return self.done(UART_NACK);
                }
                self.erase(kind);
                self.done(UART_ACK);
            }
            _ => (),
        }
    }

    fn command(&mut self, c: u8) {
        match c {
            0x00 => {
                let mut r = vec![UART_ACK, self.config.commands.len() as u8, self.config.version];
                r.extend_from_slice(&self.config.commands);
                r.push(UART_ACK);
                self.reply(&r);
            }
            0x01 => {
                let v = self.config.version;
                self.reply(&[UART_ACK, v, 0x00, 0x00, UART_ACK]);
            }
            0x02 => {
                let id = self.config.chip_id.to_be_bytes();
                self.reply(&[UART_ACK, 0x01, id[0], id[1], UART_ACK]);
            }
            0x11 | 0x21 | 0x31 => {
                self.stage = Stage::Address(c);
                self.reply(&[UART_ACK]);
            }
            0x43 => {
                self.stage = Stage::Erase;
                self.reply(&[UART_ACK]);
            }
            0x44 => {
                self.stage = Stage::ExtendedErase;
                self.reply(&[UART_ACK]);
            }
            _ => self.reply(&[UART_NACK]),
        }
    }

    fn erase(&mut self, kind: EraseKind) {
        match &kind {
            EraseKind::Pages(pages) => {
                for p in pages {
                    let start = *p as usize * PAGE_SIZE;
                    if start < FLASH_SIZE {
                        self.flash[start..start + PAGE_SIZE].iter_mut().for_each(|b| *b = 0xFF);
                    }
                }
            }
            _ => self.flash.iter_mut().for_each(|b| *b = 0xFF),
        }
        self.erases.push(kind);
    }
}

/// Handle onto the simulated device, clones share state
#[derive(Clone, Debug)]
pub struct SimPort(Arc<Mutex<Sim>>);

impl SimPort {
    pub fn new(config: SimConfig) -> Self {
        Self(Arc::new(Mutex::new(Sim::new(config))))
    }

    pub fn sim(&self) -> MutexGuard<'_, Sim> {
        self.0.lock().unwrap()
    }

    /// Preload flash contents
    pub fn load(&self, address: u32, data: &[u8]) {
        let mut s = self.sim();
        let start = s.offset(address, data.len()).unwrap();
        s.flash[start..start + data.len()].copy_from_slice(data);
    }

    pub fn flash(&self, address: u32, len: usize) -> Vec<u8> {
        let s = self.sim();
        let start = s.offset(address, len).unwrap();
        s.flash[start..start + len].to_vec()
    }

    /// Queue output as if printed by the running application
    pub fn emit(&self, data: &[u8]) {
        self.sim().reply(data);
    }
}

impl Read<u8> for SimPort {
    type Error = SimError;

    fn read(&mut self) -> nb::Result<u8, SimError> {
        self.sim().rx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl Write<u8> for SimPort {
    type Error = SimError;

    fn write(&mut self, word: u8) -> nb::Result<(), SimError> {
        self.sim().receive(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), SimError> {
        Ok(())
    }
}

impl SerialPort<SimError> for SimPort {
    fn set_rts(&mut self, _level: bool) -> Result<(), SimError> {
        Ok(())
    }
    fn set_dtr(&mut self, _level: bool) -> Result<(), SimError> {
        Ok(())
    }
}

pub fn options() -> Options {
    Options { no_reset: true, ..Options::default() }
}

pub fn programmer<P: SerialPort<SimError>>(port: P) -> Programmer<P, MockNoop, SimError> {
    Programmer::new(port, MockNoop::new(), options())
}

/// Deterministic non-erased test pattern
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed)).collect()
}
