//! Firmware image decoding.
//!
//! Intel HEX and raw binary files are turned into an ordered list of
//! [`MemorySegment`]s. Decoding is pure: callers read the file and pass the
//! bytes in, so a malformed image is rejected before any device I/O.

use std::path::Path;

use thiserror::Error;

const DATA: u8 = 0x00;
const END_OF_FILE: u8 = 0x01;
const EXT_SEGMENT_ADDRESS: u8 = 0x02;
const EXT_LINEAR_ADDRESS: u8 = 0x04;

/// Payload bytes per record written by [`encode_ihex`]
const RECORD_LEN: usize = 16;

/// A contiguous run of bytes destined for `address`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemorySegment {
    pub address: u32,
    pub data: Vec<u8>,
}

impl MemorySegment {
    pub fn new(address: u32, data: Vec<u8>) -> Self {
        Self { address, data }
    }

    /// First address past the end of this segment
    pub fn end(&self) -> u64 {
        self.address as u64 + self.data.len() as u64
    }
}

/// Total payload size of an image
pub fn image_size(segments: &[MemorySegment]) -> usize {
    segments.iter().map(|s| s.data.len()).sum()
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Format {
    IntelHex,
    Binary,
}

impl Format {
    /// Guess the format from a file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "hex" | "ihex" | "ihx" => Some(Format::IntelHex),
            "bin" => Some(Format::Binary),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum FormatErrorKind {
    #[error("record does not start with ':'")]
    MissingStartCode,
    #[error("odd number of hex digits")]
    OddDigitCount,
    #[error("invalid hex digit")]
    InvalidDigit,
    #[error("record too short")]
    TooShort,
    #[error("byte count does not match record length")]
    LengthMismatch,
    #[error("malformed address record")]
    BadAddressRecord,
    #[error("data extends past the 32-bit address space")]
    AddressOverflow,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("line {line}: {kind}")]
    Format { line: usize, kind: FormatErrorKind },

    #[error("line {line}: checksum mismatch (expected 0x{expected:02x}, found 0x{found:02x})")]
    Checksum { line: usize, expected: u8, found: u8 },

    #[error("overlapping data at 0x{address:08x}")]
    Overlap { address: u32 },
}

/// Decode a firmware image.
///
/// `base` is only used for raw binaries, which carry no addressing of their own.
pub fn decode(bytes: &[u8], format: Format, base: u32) -> Result<Vec<MemorySegment>, DecodeError> {
    match format {
        Format::IntelHex => decode_ihex(bytes),
        Format::Binary => decode_binary(bytes, base),
    }
}

fn decode_binary(bytes: &[u8], base: u32) -> Result<Vec<MemorySegment>, DecodeError> {
    if bytes.is_empty() {
        return Ok(vec![]);
    }

    if base as u64 + bytes.len() as u64 > 1 << 32 {
        return Err(DecodeError::Format { line: 0, kind: FormatErrorKind::AddressOverflow });
    }

    Ok(vec![MemorySegment::new(base, bytes.to_vec())])
}

struct Record {
    kind: u8,
    offset: u16,
    data: Vec<u8>,
}

fn parse_record(line: usize, text: &[u8]) -> Result<Record, DecodeError> {
    let err = |kind| DecodeError::Format { line, kind };

    if text[0] != b':' {
        return Err(err(FormatErrorKind::MissingStartCode));
    }

    let digits = &text[1..];
    if digits.len() % 2 != 0 {
        return Err(err(FormatErrorKind::OddDigitCount));
    }

    let bytes = hex::decode(digits).map_err(|_| err(FormatErrorKind::InvalidDigit))?;
    if bytes.len() < 5 {
        return Err(err(FormatErrorKind::TooShort));
    }

    let count = bytes[0] as usize;
    if bytes.len() != count + 5 {
        return Err(err(FormatErrorKind::LengthMismatch));
    }

    let (body, found) = bytes.split_at(bytes.len() - 1);
    let expected = sum(body).wrapping_neg();
    if expected != found[0] {
        return Err(DecodeError::Checksum { line, expected, found: found[0] });
    }

    Ok(Record {
        kind: bytes[3],
        offset: u16::from_be_bytes([bytes[1], bytes[2]]),
        data: bytes[4..4 + count].to_vec(),
    })
}

fn decode_ihex(bytes: &[u8]) -> Result<Vec<MemorySegment>, DecodeError> {
    let mut segments: Vec<MemorySegment> = Vec::new();
    let mut upper = 0u32;
    let mut terminated = false;

    for (i, raw) in bytes.split(|b| *b == b'\n').enumerate() {
        let line = i + 1;
        let text = trim(raw);

        if text.is_empty() || text[0] == b'#' {
            continue;
        }

        let record = parse_record(line, text)?;

        match record.kind {
            DATA => {
                if record.data.is_empty() {
                    continue;
                }

                let address = upper as u64 + record.offset as u64;
                if address + record.data.len() as u64 > 1 << 32 {
                    return Err(DecodeError::Format { line, kind: FormatErrorKind::AddressOverflow });
                }
                let address = address as u32;

                match segments.last_mut() {
                    Some(s) if s.end() == address as u64 => s.data.extend_from_slice(&record.data),
                    _ => segments.push(MemorySegment::new(address, record.data)),
                }
            }
            END_OF_FILE => {
                terminated = true;
                break;
            }
            EXT_SEGMENT_ADDRESS | EXT_LINEAR_ADDRESS => {
                if record.data.len() != 2 {
                    return Err(DecodeError::Format { line, kind: FormatErrorKind::BadAddressRecord });
                }

                let value = u16::from_be_bytes([record.data[0], record.data[1]]) as u32;
                upper = if record.kind == EXT_SEGMENT_ADDRESS { value << 4 } else { value << 16 };
            }
            other => trace!("line {}: ignoring record type 0x{:02x}", line, other),
        }
    }

    if !terminated {
        warn!("Intel HEX image has no end-of-file record");
    }

    normalise(segments)
}

/// Sort segments by address, merging touching runs and rejecting overlaps
fn normalise(mut segments: Vec<MemorySegment>) -> Result<Vec<MemorySegment>, DecodeError> {
    segments.sort_by_key(|s| s.address);

    let mut out: Vec<MemorySegment> = Vec::with_capacity(segments.len());
    for s in segments {
        if let Some(prev) = out.last_mut() {
            if prev.end() > s.address as u64 {
                return Err(DecodeError::Overlap { address: s.address });
            }
            if prev.end() == s.address as u64 {
                prev.data.extend_from_slice(&s.data);
                continue;
            }
        }
        out.push(s);
    }

    Ok(out)
}

fn trim(mut s: &[u8]) -> &[u8] {
    while let Some((first, rest)) = s.split_first() {
        if !first.is_ascii_whitespace() {
            break;
        }
        s = rest;
    }
    while let Some((last, rest)) = s.split_last() {
        if !last.is_ascii_whitespace() {
            break;
        }
        s = rest;
    }
    s
}

fn sum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

fn push_record(out: &mut String, kind: u8, offset: u16, data: &[u8]) {
    let mut record = Vec::with_capacity(data.len() + 5);
    record.push(data.len() as u8);
    record.extend_from_slice(&offset.to_be_bytes());
    record.push(kind);
    record.extend_from_slice(data);
    record.push(sum(&record).wrapping_neg());

    out.push(':');
    out.push_str(&hex::encode_upper(&record));
    out.push('\n');
}

/// Serialise segments as Intel HEX, using extended linear address records
pub fn encode_ihex(segments: &[MemorySegment]) -> String {
    let mut out = String::new();
    let mut upper = None;

    for s in segments {
        let mut address = s.address;
        let mut data = &s.data[..];

        while !data.is_empty() {
            let hi = (address >> 16) as u16;
            if upper != Some(hi) {
                push_record(&mut out, EXT_LINEAR_ADDRESS, 0, &hi.to_be_bytes());
                upper = Some(hi);
            }

            // records must not straddle a 64 KiB boundary
            let room = 0x1_0000 - (address & 0xFFFF) as usize;
            let n = data.len().min(RECORD_LEN).min(room);

            push_record(&mut out, DATA, address as u16, &data[..n]);

            address = address.wrapping_add(n as u32);
            data = &data[n..];
        }
    }

    push_record(&mut out, END_OF_FILE, 0, &[]);
    out
}
