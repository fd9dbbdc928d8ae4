use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// Frames claiming a larger payload are treated as corruption.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Write one frame; returns its size in bytes.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<u64> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(8 + u64::from(len))
}

/// Fill `buf` completely. `Ok(false)` on a clean or partial EOF.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Why replay stopped before the physical end of the file.
#[derive(Debug, PartialEq, Eq)]
enum Tail {
    Clean,
    Truncated,
    Corrupt,
}

/// Next verified payload, or the reason there is none.
fn read_frame(reader: &mut impl Read) -> io::Result<Result<Vec<u8>, Tail>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(Err(Tail::Clean)),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(Err(Tail::Corrupt));
    }

    let mut payload = vec![0u8; len];
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut payload)? || !read_full(reader, &mut crc_buf)? {
        return Ok(Err(Tail::Truncated));
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(Err(Tail::Corrupt));
    }
    Ok(Ok(payload))
}

/// Append-only event log backing one rental store.
///
/// Each record is `[u32 len][bincode Event][u32 crc32]`, little endian. A
/// torn or corrupt tail (crash mid-write) ends replay; everything before it
/// is kept.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// Logical length: bytes on disk plus bytes still buffered.
    len: u64,
    appends_since_compact: u64,
}

/// Log position to roll back to when a group commit fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mark {
    len: u64,
    appends: u64,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            len,
            appends_since_compact: 0,
        })
    }

    /// Append and fsync one event.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event; it is durable only after the next `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        self.len += encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn mark(&self) -> Mark {
        Mark {
            len: self.len,
            appends: self.appends_since_compact,
        }
    }

    /// Drop everything appended after `mark`, buffered or already on disk.
    pub fn rollback(&mut self, mark: Mark) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        // Unflushed bytes are discarded, not written.
        let (_, _discarded) = std::mem::replace(&mut self.writer, BufWriter::new(file)).into_parts();
        let file = self.writer.get_ref();
        file.set_len(mark.len)?;
        file.sync_all()?;
        self.len = mark.len;
        self.appends_since_compact = mark.appends;
        Ok(())
    }

    /// Swap in a read-only handle so the next flush fails. `rollback`
    /// restores a writable one.
    #[cfg(test)]
    pub fn fail_writes(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer = BufWriter::new(File::open(&self.path)?);
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_tmp_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write a replacement log next to `path` and fsync it. The live log is
    /// untouched until `swap_compact_file`.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_tmp_path(path))?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the replacement over the live log and reopen it for appends.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        fs::rename(Self::compact_tmp_path(&self.path), &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Read every intact event from `path`. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();

        let tail = loop {
            let payload = match read_frame(&mut reader)? {
                Ok(payload) => payload,
                Err(tail) => break tail,
            };
            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => events.push(event),
                Err(_) => break Tail::Corrupt,
            }
        };
        if tail != Tail::Clean {
            warn!(
                "{}: discarded {:?} tail after {} events",
                path.display(),
                tail,
                events.len()
            );
        }

        Ok(events)
    }
}
