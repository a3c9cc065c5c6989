//! Flash orchestration: chunked erase, write, verify and read-back on top of
//! a connected [`Programmer`].

use core::fmt::{self, Debug};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Sender, TrySendError};
use embedded_hal::blocking::delay::DelayMs;

use crate::image::{image_size, MemorySegment};
use crate::protocol::{EraseKind, DEFAULT_CHUNK, FLASH_BASE};
use crate::{Error, Programmer, SerialPort};

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Phase {
    Erase,
    Write,
    Verify,
    Read,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Erase => "erase",
            Phase::Write => "write",
            Phase::Verify => "verify",
            Phase::Read => "read",
        };
        f.write_str(s)
    }
}

/// Progress of a composite operation.
///
/// Erase progress counts erase units (pages, or one for a global erase),
/// the other phases count bytes.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ProgressEvent {
    pub bytes_done: u32,
    pub bytes_total: u32,
    pub phase: Phase,
}

/// Receives progress events, must not block
pub trait Observer {
    fn notify(&mut self, event: ProgressEvent);
}

impl<F> Observer for F
where
    F: FnMut(ProgressEvent),
{
    fn notify(&mut self, event: ProgressEvent) {
        self(event)
    }
}

/// Forwards progress over a channel, dropping events when a bounded channel is full
pub struct ChannelObserver(pub Sender<ProgressEvent>);

impl Observer for ChannelObserver {
    fn notify(&mut self, event: ProgressEvent) {
        match self.0.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => (),
            Err(TrySendError::Full(_)) => trace!("Progress channel full, dropping {:?}", event),
        }
    }
}

/// Shared flag used to stop an operation at the next chunk boundary
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum EraseMode {
    Skip,
    Global,
    /// Erase only the pages covered by the image
    Pages,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FlashOptions {
    pub erase: EraseMode,
    pub verify: bool,
    /// Jump to the first segment once written
    pub run: bool,
    /// Page size override for devices without uniform geometry in the chip table
    pub page_size: Option<u32>,
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self { erase: EraseMode::Global, verify: true, run: true, page_size: None }
    }
}

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum FlashError<E: Debug + 'static> {
    #[error(transparent)]
    Device(#[from] Error<E>),

    #[error("{phase} failed at chunk {chunk} (0x{address:08x})")]
    Chunk {
        phase: Phase,
        chunk: usize,
        address: u32,
        #[source]
        source: Error<E>,
    },

    #[error("verify mismatch at 0x{address:08x}: expected 0x{expected:02x}, read 0x{actual:02x}")]
    VerifyMismatch { address: u32, expected: u8, actual: u8 },

    #[error("cancelled at 0x{address:08x}{}", partial_note(.partial))]
    Cancelled { address: u32, partial: bool },

    #[error("image contains no data")]
    EmptyImage,
}

fn partial_note(partial: &bool) -> &'static str {
    if *partial {
        ", flash is partially written"
    } else {
        ""
    }
}

impl<E: Debug + 'static> FlashError<E> {
    /// Whether repeating the whole operation after reconnecting is sensible
    pub fn is_retryable(&self) -> bool {
        match self {
            FlashError::Device(Error::SyncTimeout { .. }) | FlashError::Device(Error::Serial(_)) => true,
            FlashError::Chunk { phase: Phase::Verify, source: Error::ProtocolTimeout, .. } => true,
            FlashError::Chunk { phase: Phase::Read, source: Error::ProtocolTimeout, .. } => true,
            _ => false,
        }
    }
}

/// One bounded read or write exchange
#[derive(Clone, Debug, PartialEq)]
pub struct Chunk<'a> {
    pub index: usize,
    pub address: u32,
    pub data: &'a [u8],
}

/// Segments split into chunks in increasing address order
#[derive(Clone, Debug, PartialEq)]
pub struct FlashPlan<'a> {
    chunks: Vec<Chunk<'a>>,
}

impl<'a> FlashPlan<'a> {
    pub fn new(segments: &'a [MemorySegment], chunk_size: usize) -> Self {
        let mut ordered: Vec<&MemorySegment> = segments.iter().collect();
        ordered.sort_by_key(|s| s.address);

        let mut chunks = Vec::new();
        for s in ordered {
            let mut address = s.address;
            for data in s.data.chunks(chunk_size.max(1)) {
                chunks.push(Chunk { index: chunks.len(), address, data });
                address = address.wrapping_add(data.len() as u32);
            }
        }

        Self { chunks }
    }

    pub fn chunks(&self) -> &[Chunk<'a>] {
        &self.chunks
    }

    /// Total payload bytes
    pub fn total(&self) -> u32 {
        self.chunks.iter().map(|c| c.data.len() as u32).sum()
    }
}

/// Flash is programmed in whole words
const WORD: u32 = 4;

/// Expand segments to whole words, filling with 0xFF.
///
/// Segments that share a word are merged so no word is programmed twice.
pub fn word_aligned(segments: &[MemorySegment]) -> Vec<MemorySegment> {
    let mut ordered: Vec<&MemorySegment> = segments.iter().filter(|s| !s.data.is_empty()).collect();
    ordered.sort_by_key(|s| s.address);

    let mut out: Vec<MemorySegment> = Vec::with_capacity(ordered.len());

    for s in ordered {
        let start = s.address & !(WORD - 1);
        let end = (s.end() + WORD as u64 - 1) & !(WORD as u64 - 1);

        if !out.last().map(|prev| prev.end() > start as u64).unwrap_or(false) {
            out.push(MemorySegment::new(start, vec![]));
        }
        let last = out.len() - 1;
        let target = &mut out[last];

        let len = (end - target.address as u64) as usize;
        if target.data.len() < len {
            target.data.resize(len, 0xFF);
        }

        let offset = (s.address - target.address) as usize;
        target.data[offset..offset + s.data.len()].copy_from_slice(&s.data);
    }

    out
}

/// Flash pages (relative to the start of flash) touched by `segments`
pub fn pages_for(segments: &[MemorySegment], page_size: u32) -> Result<Vec<u16>, &'static str> {
    if page_size == 0 {
        return Err("zero page size");
    }

    let mut pages = BTreeSet::new();

    for s in segments.iter().filter(|s| !s.data.is_empty()) {
        if s.address < FLASH_BASE {
            return Err("segment below flash base");
        }

        let first = (s.address - FLASH_BASE) / page_size;
        let last = ((s.end() - 1 - FLASH_BASE as u64) / page_size as u64) as u32;

        for p in first..=last {
            if p > u16::MAX as u32 {
                return Err("page index out of range");
            }
            pages.insert(p as u16);
        }
    }

    Ok(pages.into_iter().collect())
}

pub struct Flasher<'a, P, D, E> {
    programmer: &'a mut Programmer<P, D, E>,
    observer: Box<dyn Observer + 'a>,
    cancel: CancelToken,
    written: bool,
}

impl<'a, P, D, E> Flasher<'a, P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug + 'static,
{
    pub fn new(programmer: &'a mut Programmer<P, D, E>) -> Self {
        Self {
            programmer,
            observer: Box::new(|_: ProgressEvent| ()),
            cancel: CancelToken::new(),
            written: false,
        }
    }

    pub fn with_observer(mut self, observer: impl Observer + 'a) -> Self {
        self.observer = Box::new(observer);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Per-exchange payload size, conservative until the device is identified
    pub fn chunk_size(&self) -> usize {
        self.programmer.device_info().map(|i| i.max_write()).unwrap_or(DEFAULT_CHUNK)
    }

    fn read_chunk_size(&self) -> usize {
        self.programmer.device_info().map(|i| i.max_read()).unwrap_or(DEFAULT_CHUNK)
    }

    /// Erase, write, optionally verify and run an image.
    ///
    /// Any chunk failure aborts the whole operation, nothing after it is attempted.
    pub fn flash(&mut self, segments: &[MemorySegment], options: &FlashOptions) -> Result<(), FlashError<E>> {
        if image_size(segments) == 0 {
            return Err(FlashError::EmptyImage);
        }

        match options.erase {
            EraseMode::Skip => debug!("Skipping erase"),
            EraseMode::Global => self.erase(&EraseKind::Global)?,
            EraseMode::Pages => {
                let pages = self.plan_page_erase(segments, options.page_size)?;
                self.erase(&EraseKind::Pages(pages))?;
            }
        }

        self.write(segments)?;

        if options.verify {
            self.verify(segments)?;
        }

        if options.run {
            if let Some(s) = segments.iter().find(|s| !s.data.is_empty()) {
                self.go(s.address)?;
            }
        }

        Ok(())
    }

    fn plan_page_erase(&self, segments: &[MemorySegment], page_size: Option<u32>) -> Result<Vec<u16>, FlashError<E>> {
        let info = self.programmer.device_info();

        if !info.map(|i| i.commands.extended_erase()).unwrap_or(false) {
            return Err(Error::<E>::UnsupportedOperation("page erase without extended erase").into());
        }

        let page_size = match page_size.or_else(|| info.and_then(|i| i.chip()).and_then(|c| c.page_size)) {
            Some(s) => s,
            None => return Err(Error::<E>::UnsupportedOperation("page erase without page geometry").into()),
        };

        let pages = pages_for(segments, page_size).map_err(Error::<E>::UnsupportedOperation)?;
        debug!("Erasing {} pages of {} bytes", pages.len(), page_size);

        Ok(pages)
    }

    /// Write all segments in increasing address order
    pub fn write(&mut self, segments: &[MemorySegment]) -> Result<(), FlashError<E>> {
        if image_size(segments) == 0 {
            return Err(FlashError::EmptyImage);
        }

        let aligned = word_aligned(segments);
        let plan = FlashPlan::new(&aligned, self.chunk_size());
        let total = plan.total();
        let mut done = 0;

        info!("Writing {} bytes in {} chunks", total, plan.chunks().len());
        self.report(Phase::Write, done, total);

        for c in plan.chunks() {
            self.checkpoint(c.address)?;

            self.programmer
                .write_memory(c.address, c.data)
                .map_err(|source| FlashError::Chunk { phase: Phase::Write, chunk: c.index, address: c.address, source })?;

            self.written = true;
            done += c.data.len() as u32;
            self.report(Phase::Write, done, total);
        }

        Ok(())
    }

    /// Read back every segment, failing on the first differing byte
    pub fn verify(&mut self, segments: &[MemorySegment]) -> Result<(), FlashError<E>> {
        let plan = FlashPlan::new(segments, self.read_chunk_size());
        let total = plan.total();
        let mut done = 0;

        info!("Verifying {} bytes", total);
        self.report(Phase::Verify, done, total);

        for c in plan.chunks() {
            self.checkpoint(c.address)?;

            let actual = self
                .programmer
                .read_memory(c.address, c.data.len())
                .map_err(|source| FlashError::Chunk { phase: Phase::Verify, chunk: c.index, address: c.address, source })?;

            if let Some((i, (e, a))) = c.data.iter().zip(actual.iter()).enumerate().find(|(_, (e, a))| e != a) {
                let address = c.address + i as u32;
                error!("Verify failed at 0x{:08x} (expected 0x{:02x}, read 0x{:02x})", address, e, a);
                return Err(FlashError::VerifyMismatch { address, expected: *e, actual: *a });
            }

            done += c.data.len() as u32;
            self.report(Phase::Verify, done, total);
        }

        Ok(())
    }

    pub fn erase(&mut self, kind: &EraseKind) -> Result<(), FlashError<E>> {
        self.checkpoint(FLASH_BASE)?;

        let units = kind.units();
        info!("Erasing ({:?})", kind);
        self.report(Phase::Erase, 0, units);

        self.programmer.erase(kind)?;

        self.report(Phase::Erase, units, units);
        Ok(())
    }

    /// Read `length` bytes starting at `address`, split into bootloader-sized exchanges
    pub fn read_memory_dump(&mut self, address: u32, length: u32) -> Result<Vec<u8>, FlashError<E>> {
        if address as u64 + length as u64 > 1 << 32 {
            return Err(Error::<E>::InvalidLength(length as usize).into());
        }

        let chunk_size = self.read_chunk_size() as u32;
        let mut data = Vec::new();
        let mut offset = 0;

        self.report(Phase::Read, 0, length);

        while offset < length {
            let a = address + offset;
            let n = (length - offset).min(chunk_size);
            self.checkpoint(a)?;

            let chunk = self.programmer.read_memory(a, n as usize).map_err(|source| FlashError::Chunk {
                phase: Phase::Read,
                chunk: (offset / chunk_size) as usize,
                address: a,
                source,
            })?;
            data.reserve(chunk.len());
            data.extend_from_slice(&chunk);

            offset += n;
            self.report(Phase::Read, offset, length);
        }

        Ok(data)
    }

    pub fn go(&mut self, address: u32) -> Result<(), FlashError<E>> {
        self.programmer.go(address)?;
        Ok(())
    }

    fn checkpoint(&self, address: u32) -> Result<(), FlashError<E>> {
        if self.cancel.is_cancelled() {
            warn!("Cancelled at 0x{:08x}", address);
            return Err(FlashError::Cancelled { address, partial: self.written });
        }
        Ok(())
    }

    fn report(&mut self, phase: Phase, bytes_done: u32, bytes_total: u32) {
        self.observer.notify(ProgressEvent { bytes_done, bytes_total, phase });
    }
}
