//! Bulk byte transfer in fixed-size blocks.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

/// Block size used for archive export.
pub const COPY_BLOCK_SIZE: usize = 4 * 1024;

/// Copy exactly `len` bytes from `reader` to `writer`.
///
/// Transfers whole `COPY_BLOCK_SIZE` blocks followed by one partial block.
/// Fails if the source ends early or either side reports an error, and
/// only returns `Ok` once the writer has been flushed.
pub fn copy_bytes<R, W>(reader: &mut R, writer: &mut W, len: u64) -> io::Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut block = [0u8; COPY_BLOCK_SIZE];
    let mut remaining = len;

    while remaining > 0 {
        let chunk = remaining.min(COPY_BLOCK_SIZE as u64) as usize;
        reader.read_exact(&mut block[..chunk])?;
        writer.write_all(&block[..chunk])?;
        remaining -= chunk as u64;
    }
    writer.flush()?;
    Ok(len)
}

/// Copy a whole file, syncing the destination before returning.
pub fn copy_file(src: &Path, dst: &Path) -> io::Result<u64> {
    let mut reader = File::open(src)?;
    let len = reader.metadata()?.len();
    let mut writer = File::create(dst)?;
    let copied = copy_bytes(&mut reader, &mut writer, len)?;
    writer.sync_all()?;
    Ok(copied)
}
