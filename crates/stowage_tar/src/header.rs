//! Encoding and decoding of the fixed 512 byte tar header block.
//!
//! Only the fields this crate produces or consumes are modelled: name, mode,
//! size, mtime, checksum, type flag, the USTAR magic and the USTAR prefix.
//! Names that do not fit the 100 byte name field are written as a GNU long
//! name record (type `L`) in front of the real header.

use std::ops::Range;

use crate::ArchiveError;

/// Size of a tar block. Headers occupy exactly one block and every body is
/// padded to a multiple of it.
pub const BLOCK_SIZE: usize = 512;

/// Longest GNU long name payload that is accepted while reading.
pub const MAX_LONG_NAME_SIZE: u64 = 64 * 1024;

/// Largest size that fits in 11 octal digits (8 GiB - 1). Bigger sizes are
/// written in the base-256 form.
pub const MAX_OCTAL_SIZE: u64 = 0o777_7777_7777;

const NAME_LEN: usize = 100;
const NAME: Range<usize> = 0..100;
const MODE: Range<usize> = 100..108;
const UID: Range<usize> = 108..116;
const GID: Range<usize> = 116..124;
const SIZE: Range<usize> = 124..136;
const MTIME: Range<usize> = 136..148;
const CHECKSUM: Range<usize> = 148..156;
const TYPE_FLAG: usize = 156;
const MAGIC: Range<usize> = 257..263;
const VERSION: Range<usize> = 263..265;
const PREFIX: Range<usize> = 345..500;

const USTAR_MAGIC: &[u8; 6] = b"ustar\0";
const USTAR_VERSION: &[u8; 2] = b"00";
const LONG_NAME_MARKER: &str = "././@LongLink";

/// The type flag of a header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryType {
    /// `0`, the legacy NUL flag and `7` (contiguous file).
    Regular,
    /// `5`
    Directory,
    /// `L`, the body holds the name of the next entry.
    GnuLongName,
    /// `K`, the body holds the link target of the next entry.
    GnuLongLink,
    /// `x`, PAX extended attributes for the next entry.
    PaxExtended,
    /// `g`, PAX global attributes.
    PaxGlobal,
    /// Anything else (links, devices, fifos, ...).
    Other(u8),
}

impl EntryType {
    /// Interprets the type flag byte of a header.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            b'0' | b'\0' | b'7' => EntryType::Regular,
            b'5' => EntryType::Directory,
            b'L' => EntryType::GnuLongName,
            b'K' => EntryType::GnuLongLink,
            b'x' => EntryType::PaxExtended,
            b'g' => EntryType::PaxGlobal,
            other => EntryType::Other(other),
        }
    }

    /// The byte written to the type flag field.
    pub fn as_byte(self) -> u8 {
        match self {
            EntryType::Regular => b'0',
            EntryType::Directory => b'5',
            EntryType::GnuLongName => b'L',
            EntryType::GnuLongLink => b'K',
            EntryType::PaxExtended => b'x',
            EntryType::PaxGlobal => b'g',
            EntryType::Other(byte) => byte,
        }
    }
}

/// The decoded content of a header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Full entry name. When decoding this already includes the USTAR prefix.
    pub name: String,
    /// Size of the body that follows the header.
    pub size: u64,
    /// Permission bits.
    pub mode: u32,
    /// Modification time in seconds since the unix epoch.
    pub mtime: u64,
    /// The type flag.
    pub entry_type: EntryType,
}

impl Header {
    /// A regular file header.
    pub fn file(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            mode: 0o644,
            mtime: 0,
            entry_type: EntryType::Regular,
        }
    }

    /// A directory header. A trailing `/` is appended to the name if missing.
    pub fn directory(name: impl Into<String>) -> Self {
        let mut name = name.into();
        if !name.ends_with('/') {
            name.push('/');
        }
        Self {
            name,
            size: 0,
            mode: 0o755,
            mtime: 0,
            entry_type: EntryType::Directory,
        }
    }

    /// Sets the modification time.
    #[must_use]
    pub fn with_mtime(self, mtime: u64) -> Self {
        Self { mtime, ..self }
    }

    /// Encodes this header into a single block.
    ///
    /// A name longer than 100 bytes is cut to its first 100 bytes, use
    /// [`Header::encode_entry`] to keep the full name.
    pub fn encode(&self) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];

        let name = self.name.as_bytes();
        let name_len = name.len().min(NAME_LEN);
        block[NAME.start..NAME.start + name_len].copy_from_slice(&name[..name_len]);

        write_octal(&mut block[MODE], u64::from(self.mode));
        write_octal(&mut block[UID], 0);
        write_octal(&mut block[GID], 0);
        write_size(&mut block[SIZE], self.size);
        write_octal(&mut block[MTIME], self.mtime);
        block[TYPE_FLAG] = self.entry_type.as_byte();
        block[MAGIC].copy_from_slice(USTAR_MAGIC);
        block[VERSION].copy_from_slice(USTAR_VERSION);

        // The checksum goes in last, it covers every other byte of the block.
        let sum = checksum(&block).0;
        let digits = format!("{sum:06o}");
        block[CHECKSUM.start..CHECKSUM.start + 6].copy_from_slice(&digits.as_bytes()[..6]);
        block[CHECKSUM.start + 6] = 0;
        block[CHECKSUM.start + 7] = b' ';

        block
    }

    /// Encodes this header, preceded by a GNU long name record when the name
    /// does not fit the name field.
    pub fn encode_entry(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BLOCK_SIZE * 3);
        if self.name.len() > NAME_LEN {
            let mut payload = self.name.clone().into_bytes();
            payload.push(0);
            let long_name = Header {
                name: LONG_NAME_MARKER.to_owned(),
                size: payload.len() as u64,
                mode: 0o644,
                mtime: 0,
                entry_type: EntryType::GnuLongName,
            };
            out.extend_from_slice(&long_name.encode());
            let padding = padding_for(payload.len() as u64) as usize;
            out.extend_from_slice(&payload);
            out.resize(out.len() + padding, 0);
        }
        out.extend_from_slice(&self.encode());
        out
    }

    /// Decodes a header block. An all zero block marks the end of the archive
    /// and yields `None`.
    pub fn decode(block: &[u8; BLOCK_SIZE]) -> Result<Option<Header>, ArchiveError> {
        if block.iter().all(|byte| *byte == 0) {
            return Ok(None);
        }

        let stored = parse_octal(&block[CHECKSUM]).ok_or_else(|| {
            ArchiveError::InvalidArchive(String::from("header checksum is not a number"))
        })?;
        let (unsigned, signed) = checksum(block);
        if stored != u64::from(unsigned) && i64::try_from(stored).ok() != Some(i64::from(signed)) {
            return Err(ArchiveError::InvalidArchive(format!(
                "header checksum mismatch: stored {stored:o}, computed {unsigned:o}"
            )));
        }

        let name = parse_string(&block[NAME]);
        let name = if &block[MAGIC] == USTAR_MAGIC {
            let prefix = parse_string(&block[PREFIX]);
            if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            }
        } else {
            name
        };

        Ok(Some(Header {
            name,
            size: decode_size(&block[SIZE])?,
            mode: parse_octal(&block[MODE])
                .and_then(|mode| u32::try_from(mode).ok())
                .unwrap_or(0),
            mtime: parse_octal(&block[MTIME]).unwrap_or(0),
            entry_type: EntryType::from_byte(block[TYPE_FLAG]),
        }))
    }
}

/// Number of zero bytes that follow a body of `size` bytes.
pub fn padding_for(size: u64) -> u64 {
    let block = BLOCK_SIZE as u64;
    (block - size % block) % block
}

/// Interprets the body of a GNU long name record.
pub fn decode_long_name(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload)
        .trim_end_matches(['\0', '\r', '\n'])
        .to_owned()
}

/// Decodes the 12 byte size field. The base-256 form is used when the high bit
/// of the first byte is set, an empty or malformed octal field reads as zero.
pub fn decode_size(field: &[u8]) -> Result<u64, ArchiveError> {
    match field.split_first() {
        Some((first, rest)) if first & 0x80 != 0 => {
            rest.iter()
                .try_fold(u64::from(first & 0x7f), |value, byte| {
                    value.checked_mul(256)?.checked_add(u64::from(*byte))
                })
                .ok_or_else(|| {
                    ArchiveError::InvalidArchive(String::from("size field out of range"))
                })
        }
        _ => Ok(parse_octal(field).unwrap_or(0)),
    }
}

fn write_size(field: &mut [u8], size: u64) {
    if size <= MAX_OCTAL_SIZE {
        write_octal(field, size);
    } else {
        field.fill(0);
        field[0] = 0x80;
        let bytes = size.to_be_bytes();
        let start = field.len() - bytes.len();
        field[start..].copy_from_slice(&bytes);
    }
}

/// Right justified octal digits followed by a single space. Values that do
/// not fit are clamped to the largest representable value.
fn write_octal(field: &mut [u8], value: u64) {
    let width = field.len() - 1;
    let max = (1u64 << (3 * width as u32)) - 1;
    let digits = format!("{:0width$o}", value.min(max));
    field[..width].copy_from_slice(digits.as_bytes());
    field[width] = b' ';
}

fn parse_octal(field: &[u8]) -> Option<u64> {
    let text = std::str::from_utf8(truncate(field)).ok()?;
    let text = text.trim_matches(|c: char| c == ' ' || c == '\0');
    if text.is_empty() {
        return None;
    }
    u64::from_str_radix(text, 8).ok()
}

fn parse_string(field: &[u8]) -> String {
    String::from_utf8_lossy(truncate(field)).trim().to_owned()
}

fn truncate(field: &[u8]) -> &[u8] {
    match field.iter().position(|byte| *byte == 0) {
        Some(end) => &field[..end],
        None => field,
    }
}

/// Unsigned and signed byte sums with the checksum field counted as spaces.
fn checksum(block: &[u8; BLOCK_SIZE]) -> (u32, i32) {
    block
        .iter()
        .enumerate()
        .map(|(index, byte)| if CHECKSUM.contains(&index) { b' ' } else { *byte })
        .fold((0u32, 0i32), |(unsigned, signed), byte| {
            (unsigned + u32::from(byte), signed + i32::from(byte as i8))
        })
}
