//! RAR volume headers and stored-entry streaming.
//!
//! Only what streaming needs is parsed: the first file header of each volume,
//! which says where that volume's slice of the entry lives, whether the entry
//! is stored (method 0) and whether it continues in the next volume. Both the
//! RAR 1.5-4.x and the RAR 5 header formats are handled.

use std::io::{self, Read, Seek, SeekFrom};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use super::reader::{ChunkSink, ExtractOutcome, VolumeSource};

const RAR4_SIGNATURE: &[u8] = b"Rar!\x1a\x07\x00";
const RAR5_SIGNATURE: &[u8] = b"Rar!\x1a\x07\x01\x00";

// RAR4 block types and flags
const RAR4_FILE: u8 = 0x74;
const RAR4_END: u8 = 0x7b;
const RAR4_LONG_BLOCK: u16 = 0x8000;
const RAR4_SPLIT_BEFORE: u16 = 0x0001;
const RAR4_SPLIT_AFTER: u16 = 0x0002;
const RAR4_ENCRYPTED: u16 = 0x0004;
const RAR4_DIRECTORY: u16 = 0x00e0;
const RAR4_LARGE: u16 = 0x0100;
const RAR4_UNICODE: u16 = 0x0200;
const RAR4_METHOD_STORE: u8 = 0x30;

// RAR5 header types and flags
const RAR5_FILE: u64 = 2;
const RAR5_ENCRYPTION: u64 = 4;
const RAR5_END: u64 = 5;
const RAR5_HAS_EXTRA: u64 = 0x0001;
const RAR5_HAS_DATA: u64 = 0x0002;
const RAR5_SPLIT_BEFORE: u64 = 0x0008;
const RAR5_SPLIT_AFTER: u64 = 0x0010;
const RAR5_FILE_DIRECTORY: u64 = 0x0001;
const RAR5_FILE_MTIME: u64 = 0x0002;
const RAR5_FILE_CRC: u64 = 0x0004;

/// Largest header we are willing to read
const MAX_HEADER_SIZE: u64 = 2 * 1024 * 1024;

/// Header format of a volume
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Format {
    Rar4,
    Rar5,
}

/// This volume's slice of the first file entry
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct FileSegment {
    /// Entry name without directories
    pub(crate) name: String,
    pub(crate) unpacked_size: u64,
    /// Absolute offset of the data area in the volume
    pub(crate) data_offset: u64,
    /// Size of the data area in this volume
    pub(crate) data_size: u64,
    pub(crate) stored: bool,
    /// Starts in a previous volume
    pub(crate) continued: bool,
    /// Continues in the next volume
    pub(crate) continues: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Volume {
    pub(crate) format: Format,
    pub(crate) entry: FileSegment,
}

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

/// Parse the signature and the first non-directory file header of a volume
pub(crate) fn read_volume<R: Read + Seek>(reader: &mut R) -> io::Result<Volume> {
    let mut signature = [0u8; 8];
    reader.seek(SeekFrom::Start(0))?;
    let n = read_up_to(reader, &mut signature)?;

    if n >= RAR5_SIGNATURE.len() && signature.starts_with(RAR5_SIGNATURE) {
        let entry = read_rar5_entry(reader)?;
        Ok(Volume {
            format: Format::Rar5,
            entry,
        })
    } else if n >= RAR4_SIGNATURE.len() && signature.starts_with(RAR4_SIGNATURE) {
        let entry = read_rar4_entry(reader)?;
        Ok(Volume {
            format: Format::Rar4,
            entry,
        })
    } else {
        Err(invalid("not a RAR archive"))
    }
}

fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn read_exact_or<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> io::Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            invalid(format!("truncated {}", what))
        } else {
            e
        }
    })
}

fn base_name(raw: &[u8]) -> String {
    let name = String::from_utf8_lossy(raw);
    name.rsplit(['/', '\\']).next().unwrap_or_default().to_string()
}

fn read_rar4_entry<R: Read + Seek>(reader: &mut R) -> io::Result<FileSegment> {
    let mut pos = RAR4_SIGNATURE.len() as u64;
    loop {
        reader.seek(SeekFrom::Start(pos))?;
        let mut base = [0u8; 7];
        read_exact_or(reader, &mut base, "block header")?;

        let kind = base[2];
        let flags = u16::from_le_bytes([base[3], base[4]]);
        let head_size = u16::from_le_bytes([base[5], base[6]]) as u64;
        if head_size < base.len() as u64 {
            return Err(invalid(format!("bad block size {} at {}", head_size, pos)));
        }

        match kind {
            RAR4_FILE => {
                let mut header = vec![0u8; head_size as usize];
                header[..7].copy_from_slice(&base);
                read_exact_or(reader, &mut header[7..], "file header")?;

                let expected = u16::from_le_bytes([base[0], base[1]]);
                let actual = (crc32fast::hash(&header[2..]) & 0xffff) as u16;
                if expected != actual {
                    return Err(invalid(format!("file header checksum mismatch at {}", pos)));
                }

                let segment = parse_rar4_file(&header, flags, pos)?;
                if flags & RAR4_DIRECTORY == RAR4_DIRECTORY {
                    pos = segment.data_offset + segment.data_size;
                    continue;
                }
                return Ok(segment);
            }
            RAR4_END => return Err(invalid("archive has no file entry")),
            _ => {
                let mut data_size = 0u64;
                if flags & RAR4_LONG_BLOCK != 0 {
                    let mut add = [0u8; 4];
                    read_exact_or(reader, &mut add, "block header")?;
                    data_size = u32::from_le_bytes(add) as u64;
                }
                pos += head_size + data_size;
            }
        }
    }
}

fn parse_rar4_file(header: &[u8], flags: u16, block_start: u64) -> io::Result<FileSegment> {
    let le32 = |at: usize| -> io::Result<u64> {
        header
            .get(at..at + 4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as u64)
            .ok_or_else(|| invalid("file header too short"))
    };

    if flags & RAR4_ENCRYPTED != 0 {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "encrypted entries are not supported",
        ));
    }

    let mut packed = le32(7)?;
    let mut unpacked = le32(11)?;
    let method = *header.get(25).ok_or_else(|| invalid("file header too short"))?;
    let name_size = header
        .get(26..28)
        .map(|b| u16::from_le_bytes([b[0], b[1]]) as usize)
        .ok_or_else(|| invalid("file header too short"))?;

    let mut name_start = 32;
    if flags & RAR4_LARGE != 0 {
        packed |= le32(32)? << 32;
        unpacked |= le32(36)? << 32;
        name_start = 40;
    }

    let mut raw_name = header
        .get(name_start..name_start + name_size)
        .ok_or_else(|| invalid("file name runs past header"))?;
    if flags & RAR4_UNICODE != 0
        && let Some(nul) = raw_name.iter().position(|&b| b == 0)
    {
        raw_name = &raw_name[..nul];
    }

    Ok(FileSegment {
        name: base_name(raw_name),
        unpacked_size: unpacked,
        data_offset: block_start + header.len() as u64,
        data_size: packed,
        stored: method == RAR4_METHOD_STORE,
        continued: flags & RAR4_SPLIT_BEFORE != 0,
        continues: flags & RAR4_SPLIT_AFTER != 0,
    })
}

/// Little cursor over a RAR5 header
struct Fields<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Fields<'a> {
    fn vint(&mut self) -> io::Result<u64> {
        let mut value = 0u64;
        for shift in (0..70).step_by(7) {
            let byte = *self
                .buf
                .get(self.at)
                .ok_or_else(|| invalid("header field runs past header"))?;
            self.at += 1;
            value |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(invalid("variable length integer too long"))
    }

    fn bytes(&mut self, len: usize) -> io::Result<&'a [u8]> {
        let out = self
            .buf
            .get(self.at..self.at + len)
            .ok_or_else(|| invalid("header field runs past header"))?;
        self.at += len;
        Ok(out)
    }
}

fn read_stream_vint<R: Read>(reader: &mut R, raw: &mut Vec<u8>) -> io::Result<u64> {
    let mut value = 0u64;
    for shift in (0..70).step_by(7) {
        let mut byte = [0u8; 1];
        read_exact_or(reader, &mut byte, "header size")?;
        raw.push(byte[0]);
        value |= ((byte[0] & 0x7f) as u64) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(invalid("variable length integer too long"))
}

fn read_rar5_entry<R: Read + Seek>(reader: &mut R) -> io::Result<FileSegment> {
    let mut pos = RAR5_SIGNATURE.len() as u64;
    loop {
        reader.seek(SeekFrom::Start(pos))?;
        let mut crc = [0u8; 4];
        read_exact_or(reader, &mut crc, "header")?;

        let mut checked = Vec::with_capacity(64);
        let header_size = read_stream_vint(reader, &mut checked)?;
        if header_size == 0 || header_size > MAX_HEADER_SIZE {
            return Err(invalid(format!("bad header size {} at {}", header_size, pos)));
        }
        let size_len = checked.len();
        checked.resize(size_len + header_size as usize, 0);
        read_exact_or(reader, &mut checked[size_len..], "header")?;

        if crc32fast::hash(&checked) != u32::from_le_bytes(crc) {
            return Err(invalid(format!("header checksum mismatch at {}", pos)));
        }

        let mut fields = Fields {
            buf: &checked[size_len..],
            at: 0,
        };
        let kind = fields.vint()?;
        let flags = fields.vint()?;
        if flags & RAR5_HAS_EXTRA != 0 {
            fields.vint()?;
        }
        let data_size = if flags & RAR5_HAS_DATA != 0 {
            fields.vint()?
        } else {
            0
        };
        let data_offset = pos + 4 + checked.len() as u64;

        match kind {
            RAR5_FILE => {
                let file_flags = fields.vint()?;
                let unpacked_size = fields.vint()?;
                let _attributes = fields.vint()?;
                if file_flags & RAR5_FILE_MTIME != 0 {
                    fields.bytes(4)?;
                }
                if file_flags & RAR5_FILE_CRC != 0 {
                    fields.bytes(4)?;
                }
                let compression = fields.vint()?;
                let _host_os = fields.vint()?;
                let name_len = fields.vint()? as usize;
                let name = fields.bytes(name_len)?;

                if file_flags & RAR5_FILE_DIRECTORY != 0 {
                    pos = data_offset + data_size;
                    continue;
                }

                return Ok(FileSegment {
                    name: base_name(name),
                    unpacked_size,
                    data_offset,
                    data_size,
                    stored: (compression >> 7) & 0x7 == 0,
                    continued: flags & RAR5_SPLIT_BEFORE != 0,
                    continues: flags & RAR5_SPLIT_AFTER != 0,
                });
            }
            RAR5_ENCRYPTION => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "encrypted archives are not supported",
                ));
            }
            RAR5_END => return Err(invalid("archive has no file entry")),
            _ => pos = data_offset + data_size,
        }
    }
}

/// Stream a stored entry volume by volume, starting at `first`
///
/// Each volume is waited for through `volumes` before it is opened, so the
/// entry can be read while later volumes are still downloading.
pub(crate) fn extract_stored(
    first: &Path,
    chunk_size: usize,
    sink: &mut dyn ChunkSink,
    volumes: &dyn VolumeSource,
) -> io::Result<ExtractOutcome> {
    let mut path = first.to_path_buf();
    let mut entry_name: Option<String> = None;
    let mut buffer = vec![0u8; chunk_size.max(1)];

    loop {
        if volumes.wait_for(&path).is_break() {
            return Ok(ExtractOutcome::Aborted);
        }

        let mut file = std::fs::File::open(&path)?;
        let segment = read_volume(&mut file)?.entry;

        if segment.continued != entry_name.is_some() {
            return Err(invalid(format!(
                "{} is out of sequence for its volume set",
                path.display()
            )));
        }
        match &entry_name {
            None => entry_name = Some(segment.name.clone()),
            Some(name) if *name != segment.name => {
                return Err(invalid(format!(
                    "{} holds {} instead of {}",
                    path.display(),
                    segment.name,
                    name
                )));
            }
            Some(_) => {}
        }
        if !segment.stored {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("{} is compressed", segment.name),
            ));
        }

        file.seek(SeekFrom::Start(segment.data_offset))?;
        let mut left = segment.data_size;
        while left > 0 {
            let want = left.min(buffer.len() as u64) as usize;
            file.read_exact(&mut buffer[..want])?;
            if let ControlFlow::Break(()) = sink.push(&buffer[..want]) {
                return Ok(ExtractOutcome::Aborted);
            }
            left -= want as u64;
        }

        if !segment.continues {
            return Ok(ExtractOutcome::Finished);
        }
        path = next_volume_name(&path)
            .ok_or_else(|| invalid(format!("cannot name the volume after {}", path.display())))?;
        tracing::debug!(volume = %path.display(), "Entry continues in next volume");
    }
}

#[allow(clippy::expect_used)]
fn part_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^(.*\.part)(\d+)(\.rar)$").expect("compile part pattern"))
}

#[allow(clippy::expect_used)]
fn old_style_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^(.*\.)([r-z])(\d{2})$").expect("compile volume pattern"))
}

#[allow(clippy::expect_used)]
fn split_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.*\.)(\d{3})$").expect("compile split pattern"))
}

/// Name of the volume following `path`
///
/// `x.part09.rar` -> `x.part10.rar`, `x.rar` -> `x.r00`, `x.r99` -> `x.s00`,
/// `x.001` -> `x.002`. Returns `None` when the name follows no known scheme.
pub fn next_volume_name(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_str()?;

    let next = if let Some(c) = part_pattern().captures(name) {
        let digits = &c[2];
        let n: u64 = digits.parse().ok()?;
        format!("{}{:0width$}{}", &c[1], n + 1, &c[3], width = digits.len())
    } else if let Some(stem) = name
        .get(..name.len().saturating_sub(4))
        .filter(|stem| !stem.is_empty() && name[stem.len()..].eq_ignore_ascii_case(".rar"))
    {
        // Keep the case of the extension: .rar -> .r00, .RAR -> .R00
        format!("{}.{}00", stem, &name[stem.len() + 1..stem.len() + 2])
    } else if let Some(c) = old_style_pattern().captures(name) {
        let letter = c[2].chars().next()?;
        let n: u32 = c[3].parse().ok()?;
        if n < 99 {
            format!("{}{}{:02}", &c[1], letter, n + 1)
        } else {
            let next_letter = char::from(letter as u8 + 1);
            if !next_letter.is_ascii_alphabetic() {
                return None;
            }
            format!("{}{}00", &c[1], next_letter)
        }
    } else if let Some(c) = split_pattern().captures(name) {
        let n: u32 = c[2].parse().ok()?;
        if n >= 999 {
            return None;
        }
        format!("{}{:03}", &c[1], n + 1)
    } else {
        return None;
    };

    Some(path.with_file_name(next))
}
