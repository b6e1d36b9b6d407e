//! Single-file archive holding every stream of a container.
//!
//! Layout: magic, version, entry count, then per entry the name length
//! (u16), name, data length (u64), CRC32 of the data and the data itself.
//! All integers are little-endian.

use super::{sibling, Streams};
use crate::error::{Result, StoreError};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

const ARCHIVE_MAGIC: &[u8; 4] = b"EAR\0";

const ARCHIVE_VERSION: u8 = 1;

const MAX_ENTRY_LEN: u64 = 1 << 32;

/// Read every stream of the archive at `path`.
pub(super) fn read_archive(path: &Path) -> Result<Streams> {
    let mut reader = BufReader::new(File::open(path)?);
    read_entries(&mut reader).map_err(|e| match e {
        StoreError::Io(io) if io.kind() == io::ErrorKind::UnexpectedEof => {
            StoreError::InvalidFormat(format!("archive {} is truncated", path.display()))
        }
        other => other,
    })
}

fn read_entries(reader: &mut impl Read) -> Result<Streams> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != ARCHIVE_MAGIC {
        return Err(StoreError::InvalidFormat("Invalid archive magic".into()));
    }

    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != ARCHIVE_VERSION {
        return Err(StoreError::InvalidFormat(format!(
            "Unsupported archive version: {}",
            version[0]
        )));
    }

    let mut count = [0u8; 4];
    reader.read_exact(&mut count)?;
    let count = u32::from_le_bytes(count);

    let mut streams = Streams::new();
    for _ in 0..count {
        let mut name_len = [0u8; 2];
        reader.read_exact(&mut name_len)?;
        let mut name = vec![0u8; u16::from_le_bytes(name_len) as usize];
        reader.read_exact(&mut name)?;
        let name = String::from_utf8(name)
            .map_err(|_| StoreError::InvalidFormat("archive entry name is not UTF-8".into()))?;

        let mut len = [0u8; 8];
        reader.read_exact(&mut len)?;
        let len = u64::from_le_bytes(len);
        if len > MAX_ENTRY_LEN {
            return Err(StoreError::InvalidFormat(format!(
                "archive entry {name} too large: {len} bytes"
            )));
        }

        let mut checksum = [0u8; 4];
        reader.read_exact(&mut checksum)?;
        let expected = u32::from_le_bytes(checksum);

        let mut data = Vec::new();
        reader.by_ref().take(len).read_to_end(&mut data)?;
        if data.len() as u64 != len {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }

        let got = crc32fast::hash(&data);
        if got != expected {
            return Err(StoreError::ChecksumMismatch { expected, got });
        }
        streams.insert(name, data);
    }
    Ok(streams)
}

/// Replace the archive at `path` with `streams`.
///
/// The archive is written next to `path` first and renamed into place.
pub(super) fn write_archive(path: &Path, streams: &Streams) -> Result<()> {
    let staging = sibling(path, ".tmp");
    {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&staging)?;
        let mut writer = BufWriter::new(file);
        write_entries(&mut writer, streams)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&staging, path)?;
    Ok(())
}

fn write_entries(writer: &mut impl Write, streams: &Streams) -> Result<()> {
    writer.write_all(ARCHIVE_MAGIC)?;
    writer.write_all(&[ARCHIVE_VERSION])?;
    writer.write_all(&(streams.len() as u32).to_le_bytes())?;

    for (name, data) in streams {
        let name_len = u16::try_from(name.len())
            .map_err(|_| StoreError::InvalidFormat(format!("stream name too long: {name}")))?;
        writer.write_all(&name_len.to_le_bytes())?;
        writer.write_all(name.as_bytes())?;
        writer.write_all(&(data.len() as u64).to_le_bytes())?;
        writer.write_all(&crc32fast::hash(data).to_le_bytes())?;
        writer.write_all(data)?;
    }
    Ok(())
}
