//! Bulk transfer: filesystem trees as one streamed tar archive.
//!
//! A worker thread packs (or unpacks) the archive on one end of a bounded
//! channel while the caller's thread moves bytes across the connection on
//! the other; the two sides share nothing but the channel. Memory stays
//! bounded to `channel_buffer` chunks regardless of archive size, and
//! extraction begins before the whole archive has arrived. A spooled mode
//! archives to a temp file first for callers that need the byte count up
//! front.

use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::mpsc;
use std::thread;

use tar::{Archive, Builder};
use walkdir::WalkDir;

use crate::error::{Result, WireError};
use crate::stream::{self, AbortHandle};
use crate::transport::Connection;

/// Outcome of a bulk transfer. Entry counts are unknown (zero) after a
/// negotiated abort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkSummary {
    /// Files archived or extracted (directories and links not counted).
    pub entries: u64,
    /// File content bytes inside the archive.
    pub payload_bytes: u64,
    /// Archive bytes moved across the connection.
    pub archive_bytes: u64,
    pub aborted: bool,
}

/// Stream `paths` to the peer as one tar archive, optionally zstd-compressed.
/// Both ends must agree on `compress` out of band.
pub fn send_paths(
    conn: &mut Connection,
    paths: &[PathBuf],
    compress: bool,
    abort: Option<&AbortHandle>,
) -> Result<BulkSummary> {
    let chunk_size = conn.config().chunk_size;
    let (tx, rx) = mpsc::sync_channel::<Vec<u8>>(conn.config().channel_buffer);
    let log = conn.event_log();
    let peer = conn.peer().to_string();
    let to_pack: Vec<PathBuf> = paths.to_vec();

    let packer = thread::spawn(move || -> Result<(u64, u64)> {
        let writer = ChannelWriter::new(tx, chunk_size);
        let res = pack_into(writer, &to_pack, compress);
        if let Err(ref e) = res {
            // Closing the pipe is the only signal the network side gets; the
            // peer observes a short archive.
            log.error("archive", &peer, &e.to_string());
        }
        res
    });

    let mut reader = ChannelReader::new(rx);
    let net = stream::send(conn, &mut reader, abort);
    drop(reader); // unblock the packer if the network path stopped early
    let packed = packer.join();

    let summary = net?;
    let (entries, payload_bytes) = match packed {
        Ok(Ok(counts)) => counts,
        _ if summary.aborted => (0, 0),
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            return Err(WireError::ArchiveError {
                reason: "archiver thread panicked".to_string(),
            })
        }
    };
    Ok(BulkSummary {
        entries,
        payload_bytes,
        archive_bytes: summary.bytes,
        aborted: summary.aborted,
    })
}

/// Archive `paths` to a temp file first, then send it. Slower and touches
/// disk, but the archive size is known before the first byte leaves.
pub fn send_paths_spooled(
    conn: &mut Connection,
    paths: &[PathBuf],
    compress: bool,
    abort: Option<&AbortHandle>,
) -> Result<BulkSummary> {
    let mut spool = tempfile::tempfile()?;
    let (entries, payload_bytes) = pack_into(&mut spool, paths, compress)?;
    spool.seek(SeekFrom::Start(0))?;
    let summary = stream::send(conn, &mut spool, abort)?;
    Ok(BulkSummary {
        entries,
        payload_bytes,
        archive_bytes: summary.bytes,
        aborted: summary.aborted,
    })
}

/// Receive a bulk transfer, extracting under `dest` as chunks arrive.
/// Extraction failures are `ArchiveError`, distinct from transport errors.
pub fn receive_into(
    conn: &mut Connection,
    dest: &Path,
    compress: bool,
    max_size: u64,
    abort: Option<&AbortHandle>,
) -> Result<BulkSummary> {
    fs::create_dir_all(dest)?;
    let chunk_size = conn.config().chunk_size;
    let (tx, rx) = mpsc::sync_channel::<Vec<u8>>(conn.config().channel_buffer);
    let dest = dest.to_path_buf();

    let unpacker = thread::spawn(move || -> Result<(u64, u64)> {
        let reader = ChannelReader::new(rx);
        if compress {
            let dec = zstd::stream::read::Decoder::new(reader)
                .map_err(|e| WireError::ArchiveError {
                    reason: format!("zstd decoder: {e}"),
                })?;
            unpack_entries(dec, &dest)
        } else {
            unpack_entries(reader, &dest)
        }
    });

    let mut writer = ChannelWriter::new(tx, chunk_size);
    let net = stream::receive(conn, &mut writer, max_size, abort);
    let _ = writer.flush();
    drop(writer); // close the pipe; the unpacker sees EOF
    let unpacked = match unpacker.join() {
        Ok(res) => res,
        Err(_) => Err(WireError::ArchiveError {
            reason: "extractor thread panicked".to_string(),
        }),
    };

    match (net, unpacked) {
        (Ok(summary), Ok((entries, payload_bytes))) => Ok(BulkSummary {
            entries,
            payload_bytes,
            archive_bytes: summary.bytes,
            aborted: summary.aborted,
        }),
        // An aborted transfer truncates the archive mid-entry; that is the
        // negotiated outcome, not a failure.
        (Ok(summary), Err(_)) if summary.aborted => Ok(BulkSummary {
            entries: 0,
            payload_bytes: 0,
            archive_bytes: summary.bytes,
            aborted: true,
        }),
        (Ok(_), Err(e)) => Err(e),
        (Err(net_err), Err(unpack_err)) => {
            // A failed extractor closes the pipe and the receive loop sees a
            // broken sink; the archive error is the root cause then.
            if matches!(&net_err, WireError::Io(e) if e.kind() == io::ErrorKind::BrokenPipe) {
                Err(unpack_err)
            } else {
                Err(net_err)
            }
        }
        (Err(e), Ok(_)) => Err(e),
    }
}

fn pack_into<W: Write>(mut out: W, paths: &[PathBuf], compress: bool) -> Result<(u64, u64)> {
    if compress {
        let mut enc =
            zstd::stream::write::Encoder::new(out, 0).map_err(|e| WireError::ArchiveError {
                reason: format!("zstd encoder: {e}"),
            })?;
        let counts = pack_paths(&mut enc, paths)?;
        let mut inner = enc.finish().map_err(|e| WireError::ArchiveError {
            reason: format!("zstd finish: {e}"),
        })?;
        inner.flush().map_err(|e| WireError::ArchiveError {
            reason: format!("flush archive: {e}"),
        })?;
        Ok(counts)
    } else {
        let counts = pack_paths(&mut out, paths)?;
        out.flush().map_err(|e| WireError::ArchiveError {
            reason: format!("flush archive: {e}"),
        })?;
        Ok(counts)
    }
}

/// Build one tar stream from `paths`. Each top-level path is archived under
/// its file name; directories are walked, with explicit entries for empty
/// directories so extraction reproduces them.
fn pack_paths<W: Write>(out: W, paths: &[PathBuf]) -> Result<(u64, u64)> {
    let mut builder = Builder::new(out);
    builder.follow_symlinks(false);
    let mut entries = 0u64;
    let mut bytes = 0u64;

    for top in paths {
        let name = top
            .file_name()
            .map(PathBuf::from)
            .ok_or_else(|| WireError::ArchiveError {
                reason: format!("path has no file name: {}", top.display()),
            })?;
        let meta = fs::symlink_metadata(top).map_err(|e| WireError::ArchiveError {
            reason: format!("stat {}: {e}", top.display()),
        })?;
        if !meta.is_dir() {
            builder
                .append_path_with_name(top, &name)
                .map_err(|e| archive_err(top, e))?;
            if meta.is_file() {
                entries += 1;
                bytes += meta.len();
            }
            continue;
        }
        for entry in WalkDir::new(top).follow_links(false) {
            let entry = entry.map_err(|e| WireError::ArchiveError {
                reason: format!("walk {}: {e}", top.display()),
            })?;
            let rel = entry.path().strip_prefix(top).unwrap_or(entry.path());
            let arcname = if rel.as_os_str().is_empty() {
                name.clone()
            } else {
                name.join(rel)
            };
            let ft = entry.file_type();
            if ft.is_dir() {
                builder
                    .append_dir(&arcname, entry.path())
                    .map_err(|e| archive_err(entry.path(), e))?;
            } else {
                builder
                    .append_path_with_name(entry.path(), &arcname)
                    .map_err(|e| archive_err(entry.path(), e))?;
                if ft.is_file() {
                    entries += 1;
                    bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
                }
            }
        }
    }
    builder.finish().map_err(|e| WireError::ArchiveError {
        reason: format!("finish archive: {e}"),
    })?;
    Ok((entries, bytes))
}

/// Unpack a tar stream under `dest`, rejecting entries that try to escape.
fn unpack_entries<R: Read>(src: R, dest: &Path) -> Result<(u64, u64)> {
    let mut archive = Archive::new(src);
    archive.set_overwrite(true);
    let mut entries = 0u64;
    let mut bytes = 0u64;
    let iter = archive.entries().map_err(|e| WireError::ArchiveError {
        reason: format!("read archive: {e}"),
    })?;
    for res in iter {
        let mut entry = res.map_err(|e| WireError::ArchiveError {
            reason: format!("archive entry: {e}"),
        })?;
        let et = entry.header().entry_type();
        if et.is_block_special() || et.is_character_special() || et.is_fifo() {
            // Skip special device/FIFO entries for safety
            continue;
        }
        let rel = entry
            .path()
            .map_err(|e| WireError::ArchiveError {
                reason: format!("entry path: {e}"),
            })?
            .into_owned();
        for comp in rel.components() {
            if matches!(comp, Component::ParentDir) {
                return Err(WireError::ArchiveError {
                    reason: format!("entry escapes destination: {}", rel.display()),
                });
            }
        }
        entry.unpack_in(dest).map_err(|e| WireError::ArchiveError {
            reason: format!("unpack {}: {e}", rel.display()),
        })?;
        if et.is_file() {
            entries += 1;
            bytes += entry.header().size().unwrap_or(0);
        }
    }
    Ok((entries, bytes))
}

fn archive_err(path: &Path, e: io::Error) -> WireError {
    WireError::ArchiveError {
        reason: format!("archive {}: {e}", path.display()),
    }
}

/// Write half of the pipe: buffers into chunk-size sends.
struct ChannelWriter {
    tx: mpsc::SyncSender<Vec<u8>>,
    buf: Vec<u8>,
    chunk_size: usize,
}

impl ChannelWriter {
    fn new(tx: mpsc::SyncSender<Vec<u8>>, chunk_size: usize) -> Self {
        Self {
            tx,
            buf: Vec::with_capacity(chunk_size),
            chunk_size,
        }
    }

    fn flush_buffer(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(self.chunk_size));
            self.tx
                .send(chunk)
                .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;
        }
        Ok(())
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut remaining = data;
        while !remaining.is_empty() {
            let room = self.chunk_size - self.buf.len();
            let take = remaining.len().min(room);
            self.buf.extend_from_slice(&remaining[..take]);
            remaining = &remaining[take..];
            if self.buf.len() >= self.chunk_size {
                self.flush_buffer()?;
            }
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buffer()
    }
}

impl Drop for ChannelWriter {
    fn drop(&mut self) {
        let _ = self.flush_buffer();
    }
}

/// Read half of the pipe; a closed channel reads as EOF.
struct ChannelReader {
    rx: mpsc::Receiver<Vec<u8>>,
    buf: Vec<u8>,
    pos: usize,
}

impl ChannelReader {
    fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            buf: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.buf.len() {
            match self.rx.recv() {
                Ok(chunk) if chunk.is_empty() => return Ok(0),
                Ok(chunk) => {
                    self.buf = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0), // channel closed, EOF
            }
        }
        let take = (self.buf.len() - self.pos).min(out.len());
        out[..take].copy_from_slice(&self.buf[self.pos..self.pos + take]);
        self.pos += take;
        Ok(take)
    }
}
