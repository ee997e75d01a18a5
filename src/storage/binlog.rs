//! Segmented binlog
//!
//! On-disk log used in two roles: the base table's write-ahead log that
//! recovery replays, and the aggregate-side replication sink that every
//! flushed bucket row is appended to.
//!
//! # Layout
//!
//! ```text
//! <dir>/binlog-00000001.log  binlog-00000002.log  ...
//!
//! segment: ┌───────┬─────────┬─────────────┬─────────────────────────┐
//!          │ magic │ version │ start_index │ records...              │
//!          │  4B   │   1B    │     8B      │                         │
//!          └───────┴─────────┴─────────────┴─────────────────────────┘
//! record:  ┌──────────┬───────┬─────────────────────────────────────┐
//!          │ len (4B) │ crc32 │ LogEntry payload                    │
//!          └──────────┴───────┴─────────────────────────────────────┘
//! ```
//!
//! Segments rotate at a size threshold; each segment header records the
//! log index its first record is expected to carry, which lets a reader
//! start replay at the right file without scanning the whole log.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::BinlogError;

use super::replicator::{LogEntry, Replicator};

/// Magic bytes identifying a binlog segment
const BINLOG_MAGIC: [u8; 4] = *b"RBLG";

/// Current segment format version
const BINLOG_VERSION: u8 = 1;

/// Segment header size (magic + version + start_index)
const SEGMENT_HEADER_SIZE: usize = 4 + 1 + 8;

/// Record header size (length + crc)
const RECORD_HEADER_SIZE: usize = 4 + 4;

/// Smallest allowed segment size
const MIN_SEGMENT_BYTES: u64 = 4 * 1024;

/// Largest allowed segment size
const MAX_SEGMENT_BYTES: u64 = 1024 * 1024 * 1024;

/// Binlog tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinlogConfig {
    /// Directory holding the segment files
    pub dir: PathBuf,

    /// Size threshold at which the active segment rotates
    #[serde(default = "default_segment_bytes")]
    pub segment_bytes: u64,

    /// Flush the OS buffer after every append
    ///
    /// Off by default; readers created through [`Binlog::reader`] always
    /// observe a flushed log regardless.
    #[serde(default)]
    pub sync_on_append: bool,
}

fn default_segment_bytes() -> u64 {
    64 * 1024 * 1024
}

impl BinlogConfig {
    /// Configuration rooted at `dir` with defaults
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            segment_bytes: default_segment_bytes(),
            sync_on_append: false,
        }
    }

    /// Small segments and eager flushing, for tests
    pub fn testing(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            segment_bytes: MIN_SEGMENT_BYTES,
            sync_on_append: true,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), BinlogError> {
        if self.segment_bytes < MIN_SEGMENT_BYTES {
            return Err(BinlogError::InvalidConfig(format!(
                "segment_bytes ({}) must be at least {}",
                self.segment_bytes, MIN_SEGMENT_BYTES
            )));
        }
        if self.segment_bytes > MAX_SEGMENT_BYTES {
            return Err(BinlogError::InvalidConfig(format!(
                "segment_bytes ({}) must not exceed {}",
                self.segment_bytes, MAX_SEGMENT_BYTES
            )));
        }
        Ok(())
    }
}

/// One segment of the log: the index its first record carries, plus its path
#[derive(Debug, Clone)]
pub struct LogPart {
    /// Expected log index of the segment's first record
    pub start_index: u64,
    /// Segment file path
    pub path: PathBuf,
}

struct ActiveSegment {
    writer: BufWriter<File>,
    written: u64,
    seq: u64,
    parts: Vec<LogPart>,
}

/// Writable, segmented binlog
///
/// Thread-safe: appends serialize on an internal mutex, metadata reads are
/// lock-free.
pub struct Binlog {
    config: BinlogConfig,
    term: AtomicU64,
    last_index: AtomicU64,
    notified: AtomicU64,
    active: Mutex<ActiveSegment>,
}

impl Binlog {
    /// Open the log at `config.dir`, creating the directory and the first
    /// segment as needed; existing segments are picked up in order
    pub fn open(config: BinlogConfig) -> Result<Self, BinlogError> {
        config.validate()?;
        fs::create_dir_all(&config.dir)?;

        let mut parts = Vec::new();
        let mut names: Vec<PathBuf> = fs::read_dir(&config.dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("binlog-") && n.ends_with(".log"))
                    .unwrap_or(false)
            })
            .collect();
        names.sort();
        for path in names {
            let start_index = read_segment_header(&path)?;
            parts.push(LogPart { start_index, path });
        }

        let mut last_index = 0;
        for part in &parts {
            last_index = last_index.max(scan_last_index(part)?);
        }

        let seq = parts.len() as u64;
        let (writer, written, seq, parts) = if let Some(last) = parts.last() {
            let file = OpenOptions::new().append(true).open(&last.path)?;
            let written = file.metadata()?.len();
            (BufWriter::new(file), written, seq, parts)
        } else {
            let (writer, part) = new_segment(&config.dir, 1, last_index.saturating_add(1))?;
            (
                writer,
                SEGMENT_HEADER_SIZE as u64,
                1,
                vec![part],
            )
        };

        info!(dir = %config.dir.display(), segments = parts.len(), last_index, "binlog opened");
        Ok(Self {
            config,
            term: AtomicU64::new(1),
            last_index: AtomicU64::new(last_index),
            notified: AtomicU64::new(0),
            active: Mutex::new(ActiveSegment {
                writer,
                written,
                seq,
                parts,
            }),
        })
    }

    /// Set the leader term stamped onto subsequent appends
    pub fn set_term(&self, term: u64) {
        self.term.store(term, Ordering::Relaxed);
    }

    /// Highest log index appended so far, 0 when empty
    pub fn last_log_index(&self) -> u64 {
        self.last_index.load(Ordering::Relaxed)
    }

    /// Number of `notify` calls observed
    pub fn notified_cnt(&self) -> u64 {
        self.notified.load(Ordering::Relaxed)
    }

    /// Ordered list of segments
    pub fn log_parts(&self) -> Vec<LogPart> {
        self.active.lock().parts.clone()
    }

    /// Open a reader over the current segments
    ///
    /// The active segment is flushed first so the reader observes every
    /// append that returned before this call.
    pub fn reader(&self) -> Result<BinlogReader, BinlogError> {
        let parts = {
            let mut active = self.active.lock();
            active.writer.flush()?;
            active.parts.clone()
        };
        Ok(BinlogReader::new(parts, self.last_log_index()))
    }
}

impl Replicator for Binlog {
    fn append_entry(&self, entry: &LogEntry) -> Result<(), BinlogError> {
        let payload = entry.to_bytes();
        let crc = crc32fast::hash(&payload);
        let record_len = (RECORD_HEADER_SIZE + payload.len()) as u64;

        let mut active = self.active.lock();
        if active.written + record_len > self.config.segment_bytes
            && active.written > SEGMENT_HEADER_SIZE as u64
        {
            active.writer.flush()?;
            let seq = active.seq + 1;
            let (writer, part) = new_segment(&self.config.dir, seq, entry.log_index)?;
            debug!(segment = %part.path.display(), start_index = entry.log_index, "binlog rotated");
            active.writer = writer;
            active.written = SEGMENT_HEADER_SIZE as u64;
            active.seq = seq;
            active.parts.push(part);
        }

        active
            .writer
            .write_all(&(payload.len() as u32).to_le_bytes())?;
        active.writer.write_all(&crc.to_le_bytes())?;
        active.writer.write_all(&payload)?;
        active.written += record_len;
        if self.config.sync_on_append {
            active.writer.flush()?;
        }
        // Stored under the append lock so concurrent appends cannot
        // publish indexes out of order.
        self.last_index.store(entry.log_index, Ordering::Relaxed);
        Ok(())
    }

    fn notify(&self) {
        self.notified.fetch_add(1, Ordering::Relaxed);
        debug!("binlog followers notified");
    }

    fn leader_term(&self) -> u64 {
        self.term.load(Ordering::Relaxed)
    }
}

fn segment_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("binlog-{:08}.log", seq))
}

fn new_segment(
    dir: &Path,
    seq: u64,
    start_index: u64,
) -> Result<(BufWriter<File>, LogPart), BinlogError> {
    let path = segment_path(dir, seq);
    let file = OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&BINLOG_MAGIC)?;
    writer.write_all(&[BINLOG_VERSION])?;
    writer.write_all(&start_index.to_le_bytes())?;
    writer.flush()?;
    Ok((writer, LogPart { start_index, path }))
}

fn read_segment_header(path: &Path) -> Result<u64, BinlogError> {
    let mut file = File::open(path)?;
    let mut header = [0u8; SEGMENT_HEADER_SIZE];
    file.read_exact(&mut header)?;
    if header[0..4] != BINLOG_MAGIC {
        return Err(BinlogError::InvalidMagic);
    }
    if header[4] != BINLOG_VERSION {
        return Err(BinlogError::UnsupportedVersion(header[4]));
    }
    Ok(u64::from_le_bytes(header[5..13].try_into().unwrap()))
}

// Walk one segment to find the log index of its final record.
fn scan_last_index(part: &LogPart) -> Result<u64, BinlogError> {
    let mut reader = SegmentReader::open(part)?;
    let mut last = 0;
    while let Some(entry) = reader.read_next()? {
        last = entry.log_index;
    }
    Ok(last)
}

struct SegmentReader {
    reader: BufReader<File>,
    pos: u64,
}

impl SegmentReader {
    fn open(part: &LogPart) -> Result<Self, BinlogError> {
        read_segment_header(&part.path)?;
        let mut file = File::open(&part.path)?;
        let mut header = [0u8; SEGMENT_HEADER_SIZE];
        file.read_exact(&mut header)?;
        Ok(Self {
            reader: BufReader::new(file),
            pos: SEGMENT_HEADER_SIZE as u64,
        })
    }

    fn read_next(&mut self) -> Result<Option<LogEntry>, BinlogError> {
        let mut header = [0u8; RECORD_HEADER_SIZE];
        let mut got = 0;
        while got < RECORD_HEADER_SIZE {
            let n = self.reader.read(&mut header[got..])?;
            if n == 0 {
                break;
            }
            got += n;
        }
        if got == 0 {
            return Ok(None);
        }
        if got < RECORD_HEADER_SIZE {
            return Err(BinlogError::CorruptedRecord {
                offset: self.pos,
                reason: "truncated record header".to_string(),
            });
        }

        let len = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
        let crc = u32::from_le_bytes(header[4..8].try_into().unwrap());
        let mut payload = vec![0u8; len];
        self.reader
            .read_exact(&mut payload)
            .map_err(|_| BinlogError::CorruptedRecord {
                offset: self.pos,
                reason: "truncated record payload".to_string(),
            })?;
        if crc32fast::hash(&payload) != crc {
            return Err(BinlogError::ChecksumMismatch { offset: self.pos });
        }
        self.pos += (RECORD_HEADER_SIZE + len) as u64;
        LogEntry::from_bytes(&payload).map(Some)
    }
}

/// Sequential reader over the binlog's segments
///
/// Reading returns `None` at the end of the current segment;
/// [`BinlogReader::roll_next_file`] moves on to the next one. This gives
/// the recovery driver explicit control over segment boundaries.
pub struct BinlogReader {
    parts: Vec<LogPart>,
    cur_part: Option<usize>,
    segment: Option<SegmentReader>,
    last_index: u64,
    end_index: u64,
}

impl BinlogReader {
    fn new(parts: Vec<LogPart>, end_index: u64) -> Self {
        Self {
            parts,
            cur_part: None,
            segment: None,
            last_index: 0,
            end_index,
        }
    }

    fn open_part(&mut self, idx: usize) -> Result<(), BinlogError> {
        self.segment = Some(SegmentReader::open(&self.parts[idx])?);
        self.cur_part = Some(idx);
        Ok(())
    }

    /// Position at the segment expected to contain `offset`
    ///
    /// Entries below `offset` that share the segment are still returned;
    /// callers replaying a log are expected to tolerate duplicates.
    pub fn set_offset(&mut self, offset: u64) -> Result<(), BinlogError> {
        if self.parts.is_empty() {
            return Ok(());
        }
        let idx = self
            .parts
            .iter()
            .rposition(|p| p.start_index <= offset)
            .unwrap_or(0);
        self.open_part(idx)
    }

    /// Read the next record of the current segment, `None` at segment end
    pub fn read_next_record(&mut self) -> Result<Option<LogEntry>, BinlogError> {
        let Some(segment) = self.segment.as_mut() else {
            return Ok(None);
        };
        match segment.read_next()? {
            Some(entry) => {
                self.last_index = entry.log_index;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// Move to the next segment; false when none remain
    pub fn roll_next_file(&mut self) -> Result<bool, BinlogError> {
        match self.cur_part {
            Some(idx) if idx + 1 < self.parts.len() => {
                self.open_part(idx + 1)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Log index of the last record read
    pub fn log_index(&self) -> u64 {
        self.last_index
    }

    /// Highest log index present when the reader was created
    pub fn end_log_index(&self) -> u64 {
        self.end_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::replicator::EntryType;
    use crate::types::Dimension;
    use bytes::Bytes;

    fn entry(index: u64, key: &str) -> LogEntry {
        LogEntry::put(
            1,
            index,
            index as i64,
            vec![Dimension::new(0, key)],
            Bytes::from(vec![index as u8; 16]),
        )
    }

    fn read_all(binlog: &Binlog) -> Vec<LogEntry> {
        let mut reader = binlog.reader().unwrap();
        reader.set_offset(0).unwrap();
        let mut out = Vec::new();
        loop {
            match reader.read_next_record().unwrap() {
                Some(e) => out.push(e),
                None => {
                    if !reader.roll_next_file().unwrap() {
                        break;
                    }
                }
            }
        }
        out
    }

    #[test]
    fn test_append_and_replay() {
        let dir = tempfile::tempdir().unwrap();
        let binlog = Binlog::open(BinlogConfig::testing(dir.path())).unwrap();
        for i in 0..10 {
            binlog.append_entry(&entry(i, "k")).unwrap();
        }
        assert_eq!(binlog.last_log_index(), 9);

        let entries = read_all(&binlog);
        assert_eq!(entries.len(), 10);
        assert_eq!(entries[0].log_index, 0);
        assert_eq!(entries[9].log_index, 9);
        assert_eq!(entries[3].entry_type, EntryType::Put);
    }

    #[test]
    fn test_rotation_and_roll() {
        let dir = tempfile::tempdir().unwrap();
        let binlog = Binlog::open(BinlogConfig::testing(dir.path())).unwrap();
        // Entries are ~70 bytes framed; enough of them forces several 4KB
        // segments.
        for i in 0..400 {
            binlog.append_entry(&entry(i, "key-with-some-width")).unwrap();
        }
        assert!(binlog.log_parts().len() > 1);

        let entries = read_all(&binlog);
        assert_eq!(entries.len(), 400);
        let indexes: Vec<u64> = entries.iter().map(|e| e.log_index).collect();
        assert_eq!(indexes, (0..400).collect::<Vec<u64>>());
    }

    #[test]
    fn test_set_offset_skips_earlier_segments() {
        let dir = tempfile::tempdir().unwrap();
        let binlog = Binlog::open(BinlogConfig::testing(dir.path())).unwrap();
        for i in 0..400 {
            binlog.append_entry(&entry(i, "key-with-some-width")).unwrap();
        }
        let parts = binlog.log_parts();
        assert!(parts.len() > 2);
        let mid_start = parts[parts.len() / 2].start_index;

        let mut reader = binlog.reader().unwrap();
        reader.set_offset(mid_start).unwrap();
        let first = reader.read_next_record().unwrap().unwrap();
        assert_eq!(first.log_index, mid_start);
        assert_eq!(reader.end_log_index(), 399);
    }

    #[test]
    fn test_reopen_recovers_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let binlog = Binlog::open(BinlogConfig::testing(dir.path())).unwrap();
            for i in 1..=5 {
                binlog.append_entry(&entry(i, "k")).unwrap();
            }
        }
        let binlog = Binlog::open(BinlogConfig::testing(dir.path())).unwrap();
        assert_eq!(binlog.last_log_index(), 5);
        binlog.append_entry(&entry(6, "k")).unwrap();
        assert_eq!(read_all(&binlog).len(), 6);
    }

    #[test]
    fn test_empty_log_reader() {
        let dir = tempfile::tempdir().unwrap();
        let binlog = Binlog::open(BinlogConfig::testing(dir.path())).unwrap();
        let mut reader = binlog.reader().unwrap();
        reader.set_offset(0).unwrap();
        assert!(reader.read_next_record().unwrap().is_none());
        assert!(!reader.roll_next_file().unwrap());
        assert_eq!(reader.end_log_index(), 0);
    }

    #[test]
    fn test_config_validation() {
        let cfg = BinlogConfig {
            dir: PathBuf::from("/tmp/x"),
            segment_bytes: 16,
            sync_on_append: false,
        };
        assert!(matches!(
            cfg.validate(),
            Err(BinlogError::InvalidConfig(_))
        ));
    }
}
