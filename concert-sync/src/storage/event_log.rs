//! Append-only, replayable event log for one session.
//!
//! Layout:
//! ```text
//! <session>/events/
//!     000000.log   sequences 1 ..= segment_size
//!     000001.log   sequences segment_size+1 ..= 2*segment_size
//!     ...
//! ```
//!
//! Each segment is a run of framed records (see [`super::record`]). The
//! in-memory index (`slots`) is rebuilt by scanning every segment on open,
//! so the tail always equals the number of sequence numbers handed out.
//!
//! A record whose length header is damaged cannot be used to find the next
//! one. The scan then resynchronises on the next footer that is followed by
//! a whole record, and the skipped stretch keeps a slot of its own so that
//! replay reports it as `CorruptEntry` instead of dropping it silently.
//! Only trailing bytes that no complete record follows are treated as a torn
//! write.
//!
//! The log has exactly one writer: the owning `Session`, which holds it
//! behind its per-session lock. Readers get a [`ReplayIter`] that owns its
//! own file handles and a snapshot of the index, so replay never blocks
//! the writer.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use super::record::{self, RecordError, HEADER_LEN, RECORD_FOOTER};
use crate::config::LogConfig;
use crate::event::{EventKind, LockActivity, PackageRef, PendingEvent, SequenceNumber, SessionEvent};

/// Event log errors.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("event log I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// One record is unreadable; replay continues with the next
    #[error("corrupt entry at sequence {sequence}: {reason}")]
    CorruptEntry {
        sequence: SequenceNumber,
        reason: RecordError,
    },
    #[error("sequence {requested} is older than retained history (first retained {first_retained})")]
    NotFound {
        requested: SequenceNumber,
        first_retained: SequenceNumber,
    },
    #[error("failed to encode record: {0}")]
    Encode(RecordError),
    #[error("package event without a package name")]
    MissingPackageName,
    #[error("sequence {sequence} does not follow tail {tail}")]
    OutOfOrder {
        sequence: SequenceNumber,
        tail: SequenceNumber,
    },
    #[error("event log {0} is open read-only")]
    ReadOnly(PathBuf),
}

/// Location of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    sequence: SequenceNumber,
    segment: u64,
    offset: u64,
    len: usize,
    /// `None` when the record was unreadable on open
    kind: Option<EventKind>,
}

struct SegmentWriter {
    segment: u64,
    file: File,
    len: u64,
}

/// Per-package history rebuilt from `Package` and `Transaction` events.
#[derive(Debug, Default)]
struct PackageIndex {
    head: u64,
    revisions: BTreeMap<u64, SequenceNumber>,
    /// Sequence of the latest package event
    saved_at: SequenceNumber,
    transactions: Vec<SequenceNumber>,
}

impl PackageIndex {
    fn live_transactions(&self) -> impl Iterator<Item = SequenceNumber> + '_ {
        let saved_at = self.saved_at;
        self.transactions.iter().copied().filter(move |sequence| *sequence > saved_at)
    }
}

/// What the open-time scan found at one spot of a segment.
#[derive(Debug)]
enum Piece {
    Record { offset: usize, len: usize, event: SessionEvent },
    Damaged { offset: usize, len: usize },
}

#[derive(Debug)]
struct SegmentScan {
    pieces: Vec<Piece>,
    /// Start of trailing bytes that no complete record follows
    torn_at: Option<usize>,
}

/// Split a segment into records and damaged stretches.
fn scan_bytes(bytes: &[u8]) -> SegmentScan {
    let mut pieces = Vec::new();
    let mut offset = 0usize;

    while offset < bytes.len() {
        let rest = &bytes[offset..];
        if let Some(total) = record::complete_frame_len(rest) {
            match record::decode_record(&rest[..total]) {
                Ok(event) => {
                    pieces.push(Piece::Record { offset, len: total, event });
                    offset += total;
                    continue;
                }
                // A footer inside the frame means the length swallowed later records
                Err(_) if record::find_footer_end(&rest[HEADER_LEN..total - RECORD_FOOTER.len()]).is_none() => {
                    pieces.push(Piece::Damaged { offset, len: total });
                    offset += total;
                    continue;
                }
                Err(_) => {}
            }
        }

        match resync(rest) {
            Some(len) => {
                pieces.push(Piece::Damaged { offset, len });
                offset += len;
            }
            None => {
                return SegmentScan {
                    pieces,
                    torn_at: Some(offset),
                }
            }
        }
    }
    SegmentScan { pieces, torn_at: None }
}

/// Length of the damaged stretch at the start of `rest`.
///
/// The declared length is kept when it ends at the segment end or right
/// before a complete record (only the footer was hit). Otherwise the
/// stretch runs to the next footer. `None` if no footer follows.
fn resync(rest: &[u8]) -> Option<usize> {
    if let Ok(total) = record::framed_len(rest) {
        if total == rest.len() || (total < rest.len() && record::complete_frame_len(&rest[total..]).is_some()) {
            return Some(total);
        }
    }
    let from = HEADER_LEN.min(rest.len());
    record::find_footer_end(&rest[from..]).map(|end| from + end)
}

/// Directory holding a session's segment files.
pub fn events_dir(session_dir: &Path) -> PathBuf {
    session_dir.join("events")
}

fn segment_path(dir: &Path, segment: u64) -> PathBuf {
    dir.join(format!("{segment:06}.log"))
}

fn parse_segment(path: &Path) -> Option<u64> {
    if path.extension()? != "log" {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

/// List segment numbers present in `dir`, ascending.
fn list_segments(dir: &Path) -> Result<Vec<u64>, std::io::Error> {
    let mut segments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(segment) = parse_segment(&entry.path()) {
            segments.push(segment);
        }
    }
    segments.sort_unstable();
    Ok(segments)
}

/// Durable, strictly ordered event storage for one session.
pub struct EventLog {
    dir: PathBuf,
    config: LogConfig,
    slots: Vec<Slot>,
    tail: SequenceNumber,
    packages: BTreeMap<String, PackageIndex>,
    resource_locks: BTreeMap<String, Vec<SequenceNumber>>,
    writer: Option<SegmentWriter>,
    corrupt_on_open: usize,
    read_only: bool,
}

impl EventLog {
    /// Open (or create) the log in `dir`, rebuilding the index from disk.
    ///
    /// A record cut short at the end of the newest segment is truncated
    /// away. Records that fail verification keep their slot so that replay
    /// reports them as `CorruptEntry`.
    pub fn open(dir: impl Into<PathBuf>, config: LogConfig) -> Result<Self, LogError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Self::load(dir, config, false)
    }

    /// Open an existing log for reading only.
    ///
    /// Nothing on disk is modified: a torn tail is skipped instead of
    /// truncated, and appends fail with `ReadOnly`.
    pub fn open_read_only(dir: impl Into<PathBuf>, config: LogConfig) -> Result<Self, LogError> {
        Self::load(dir.into(), config, true)
    }

    fn load(dir: PathBuf, config: LogConfig, read_only: bool) -> Result<Self, LogError> {
        let mut log = Self {
            dir,
            config,
            slots: Vec::new(),
            tail: 0,
            packages: BTreeMap::new(),
            resource_locks: BTreeMap::new(),
            writer: None,
            corrupt_on_open: 0,
            read_only,
        };

        let segments = list_segments(&log.dir)?;
        let newest = segments.last().copied();
        let mut damaged = Vec::new();
        for segment in segments {
            log.scan_segment(segment, Some(segment) == newest, &mut damaged)?;
        }
        log.settle_damage(&mut damaged, None);

        log::debug!(
            "Opened event log {} (tail {}, {} records, {} corrupt{})",
            log.dir.display(),
            log.tail,
            log.slots.len(),
            log.corrupt_on_open,
            if read_only { ", read-only" } else { "" }
        );
        Ok(log)
    }

    fn scan_segment(&mut self, segment: u64, newest: bool, damaged: &mut Vec<Slot>) -> Result<(), LogError> {
        let path = segment_path(&self.dir, segment);
        let bytes = fs::read(&path)?;
        let scan = scan_bytes(&bytes);

        for piece in scan.pieces {
            match piece {
                Piece::Record { offset, len, event } if event.sequence > self.tail => {
                    self.settle_damage(damaged, Some(event.sequence));
                    self.slots.push(Slot {
                        sequence: event.sequence,
                        segment,
                        offset: offset as u64,
                        len,
                        kind: Some(event.kind),
                    });
                    self.tail = event.sequence;
                    self.index(&event);
                }
                Piece::Record { offset, len, event } => {
                    log::warn!(
                        "Record at {}:{} has sequence {} behind tail {}; treating as corrupt",
                        path.display(),
                        offset,
                        event.sequence,
                        self.tail
                    );
                    damaged.push(Slot {
                        sequence: 0,
                        segment,
                        offset: offset as u64,
                        len,
                        kind: None,
                    });
                }
                Piece::Damaged { offset, len } => {
                    log::warn!("Unreadable record at {}:{} ({} bytes)", path.display(), offset, len);
                    damaged.push(Slot {
                        sequence: 0,
                        segment,
                        offset: offset as u64,
                        len,
                        kind: None,
                    });
                }
            }
        }

        let Some(torn_at) = scan.torn_at else {
            return Ok(());
        };
        let trailing = bytes.len() - torn_at;
        if !newest {
            // Later segments exist, so these bytes held a record once
            log::warn!(
                "Unreadable trailing {} bytes in sealed segment {}",
                trailing,
                path.display()
            );
            damaged.push(Slot {
                sequence: 0,
                segment,
                offset: torn_at as u64,
                len: trailing,
                kind: None,
            });
        } else if self.read_only {
            log::warn!(
                "Ignoring partial record at {}:{} ({} trailing bytes)",
                path.display(),
                torn_at,
                trailing
            );
        } else {
            log::warn!(
                "Truncating partial record at {}:{} ({} trailing bytes)",
                path.display(),
                torn_at,
                trailing
            );
            OpenOptions::new().write(true).open(&path)?.set_len(torn_at as u64)?;
        }
        Ok(())
    }

    /// Give unreadable records the sequence numbers missing before `next`,
    /// or the numbers after the tail when nothing readable follows.
    ///
    /// A gap with no damage next to it is left alone: filtered archives and
    /// pruned logs skip sequence numbers legitimately.
    fn settle_damage(&mut self, damaged: &mut Vec<Slot>, next: Option<SequenceNumber>) {
        if damaged.is_empty() {
            return;
        }
        self.corrupt_on_open += damaged.len();

        let missing = match next {
            Some(next) => (next - self.tail - 1) as usize,
            None => damaged.len(),
        };
        if missing < damaged.len() {
            log::warn!(
                "{} unreadable stretches in {} but only {} sequence numbers are missing",
                damaged.len(),
                self.dir.display(),
                missing
            );
        }
        for mut slot in damaged.drain(..).take(missing) {
            slot.sequence = self.tail + 1;
            self.tail = slot.sequence;
            self.slots.push(slot);
        }
    }

    fn index(&mut self, event: &SessionEvent) {
        match event.kind {
            EventKind::Package => {
                if let Some(package) = &event.package {
                    let entry = self.packages.entry(package.name.clone()).or_default();
                    entry.head = entry.head.max(package.revision);
                    entry.revisions.insert(package.revision, event.sequence);
                    entry.saved_at = event.sequence;
                }
            }
            EventKind::Transaction => {
                if let Some(package) = &event.package {
                    self.packages
                        .entry(package.name.clone())
                        .or_default()
                        .transactions
                        .push(event.sequence);
                }
            }
            EventKind::Lock => {
                let Some(bytes) = event.payload.as_inline() else {
                    return;
                };
                // Lock bodies are opaque to the log unless they decode
                if let Ok(activity) = LockActivity::decode(bytes) {
                    for resource in activity.resources {
                        self.resource_locks.entry(resource).or_default().push(event.sequence);
                    }
                }
            }
            EventKind::Connection => {}
        }
    }

    /// Assign the next sequence number, persist the event and return it.
    ///
    /// On failure nothing is consumed: the segment is rolled back and the
    /// tail is unchanged.
    pub fn append(
        &mut self,
        pending: PendingEvent,
        timestamp: DateTime<Utc>,
    ) -> Result<SessionEvent, LogError> {
        let sequence = self.tail + 1;
        let package = match (pending.kind, pending.package_name.clone()) {
            (EventKind::Package, Some(name)) => {
                let revision = self.package_head_revision(&name) + 1;
                Some(PackageRef { name, revision })
            }
            (EventKind::Package, None) => return Err(LogError::MissingPackageName),
            (EventKind::Transaction, Some(name)) => {
                let revision = self.package_head_revision(&name);
                Some(PackageRef { name, revision })
            }
            _ => None,
        };

        let event = pending.into_event(sequence, timestamp, package);
        self.persist(&event)?;
        Ok(event)
    }

    /// Append an already-sequenced event (archive import).
    ///
    /// Sequence numbers must increase but may skip values.
    pub fn append_sequenced(&mut self, event: &SessionEvent) -> Result<(), LogError> {
        if event.sequence <= self.tail {
            return Err(LogError::OutOfOrder {
                sequence: event.sequence,
                tail: self.tail,
            });
        }
        self.persist(event)
    }

    fn persist(&mut self, event: &SessionEvent) -> Result<(), LogError> {
        let framed = record::encode_record(event, self.config.compress_threshold)
            .map_err(LogError::Encode)?;
        let slot = self.write_framed(event, &framed)?;

        self.slots.push(slot);
        self.tail = event.sequence;
        self.index(event);
        Ok(())
    }

    fn write_framed(&mut self, event: &SessionEvent, framed: &[u8]) -> Result<Slot, LogError> {
        if self.read_only {
            return Err(LogError::ReadOnly(self.dir.clone()));
        }
        let sequence = event.sequence;
        let segment = (sequence - 1) / self.config.segment_size;
        let mut writer = match self.writer.take() {
            Some(writer) if writer.segment == segment => writer,
            _ => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(segment_path(&self.dir, segment))?;
                let len = file.metadata()?.len();
                SegmentWriter { segment, file, len }
            }
        };

        let offset = writer.len;
        let mut result = writer.file.write_all(framed);
        if result.is_ok() && self.config.sync_writes {
            result = writer.file.sync_data();
        }
        if let Err(e) = result {
            if let Err(rollback) = writer.file.set_len(offset) {
                log::error!("Failed to roll back segment {segment} to {offset}: {rollback}");
            }
            return Err(e.into());
        }

        writer.len += framed.len() as u64;
        self.writer = Some(writer);
        Ok(Slot {
            sequence,
            segment,
            offset,
            len: framed.len(),
            kind: Some(event.kind),
        })
    }

    /// Lazily read every retained event with sequence >= `from`.
    ///
    /// `from == 0` is treated as 1. A start beyond the tail yields an empty
    /// iterator.
    pub fn read_from(&self, from: SequenceNumber) -> Result<ReplayIter, LogError> {
        let from = from.max(1);
        let first_retained = self.first_retained();
        if from < first_retained && first_retained > 1 {
            return Err(LogError::NotFound {
                requested: from,
                first_retained,
            });
        }
        let start = self.slots.partition_point(|slot| slot.sequence < from);
        Ok(self.snapshot(self.slots[start..].to_vec()))
    }

    /// Up to `limit` events from `from` onwards, optionally of one kind.
    ///
    /// Unlike `read_from` this is a browsing query: a start inside pruned
    /// history simply begins at the first retained event. Unreadable
    /// records only show up when no kind is requested.
    pub fn activities(&self, from: SequenceNumber, limit: usize, kind: Option<EventKind>) -> ReplayIter {
        let start = self.slots.partition_point(|slot| slot.sequence < from);
        let slots = self.slots[start..]
            .iter()
            .filter(|slot| kind.is_none() || slot.kind == kind)
            .take(limit)
            .copied()
            .collect();
        self.snapshot(slots)
    }

    /// Read one event, `None` if the log holds no record for `sequence`.
    pub fn read_event(&self, sequence: SequenceNumber) -> Result<Option<SessionEvent>, LogError> {
        let Some(slot) = self.slot(sequence) else {
            return Ok(None);
        };
        self.snapshot(Vec::new()).read_slot(slot).map(Some)
    }

    /// The package event holding `revision` of `package` (head if `None`).
    pub fn package_event(&self, package: &str, revision: Option<u64>) -> Result<Option<SessionEvent>, LogError> {
        let Some(index) = self.packages.get(package) else {
            return Ok(None);
        };
        let revision = revision.unwrap_or(index.head);
        match index.revisions.get(&revision) {
            Some(sequence) => self.read_event(*sequence),
            None => Ok(None),
        }
    }

    /// Head revision of every package that has one, ordered by name.
    pub fn head_packages(&self) -> Vec<PackageRef> {
        self.packages
            .iter()
            .filter(|(_, index)| index.head > 0)
            .map(|(name, index)| PackageRef {
                name: name.clone(),
                revision: index.head,
            })
            .collect()
    }

    /// Read the head revision event of every package, in log order.
    pub fn head_package_events(&self) -> ReplayIter {
        let mut slots: Vec<Slot> = self
            .packages
            .values()
            .filter_map(|index| index.revisions.get(&index.head))
            .filter_map(|sequence| self.slot(*sequence))
            .collect();
        slots.sort_unstable_by_key(|slot| slot.sequence);
        self.snapshot(slots)
    }

    /// Transactions on `package` recorded after its latest package event.
    pub fn live_transactions(&self, package: &str) -> Vec<SequenceNumber> {
        self.packages
            .get(package)
            .map(|index| index.live_transactions().collect())
            .unwrap_or_default()
    }

    /// Packages that have at least one live transaction.
    pub fn packages_with_live_transactions(&self) -> Vec<String> {
        self.packages
            .iter()
            .filter(|(_, index)| index.live_transactions().next().is_some())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Lock events that named `resource`, oldest first.
    pub fn lock_events_for(&self, resource: &str) -> Vec<SequenceNumber> {
        self.resource_locks.get(resource).cloned().unwrap_or_default()
    }

    fn slot(&self, sequence: SequenceNumber) -> Option<Slot> {
        self.slots
            .binary_search_by_key(&sequence, |slot| slot.sequence)
            .ok()
            .map(|pos| self.slots[pos])
    }

    fn snapshot(&self, slots: Vec<Slot>) -> ReplayIter {
        ReplayIter {
            dir: self.dir.clone(),
            slots,
            pos: 0,
            reader: None,
        }
    }

    /// Last assigned sequence number, 0 if empty.
    pub fn tail(&self) -> SequenceNumber {
        self.tail
    }

    /// Oldest sequence number still readable (tail + 1 if empty).
    pub fn first_retained(&self) -> SequenceNumber {
        self.slots.first().map_or(self.tail + 1, |slot| slot.sequence)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Latest revision assigned to `package`, 0 if it has no history.
    pub fn package_head_revision(&self, package: &str) -> u64 {
        self.packages.get(package).map_or(0, |index| index.head)
    }

    /// Records that failed verification while opening.
    pub fn corrupt_on_open(&self) -> usize {
        self.corrupt_on_open
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Segment files currently on disk, oldest first.
    pub fn segment_files(&self) -> Result<Vec<PathBuf>, LogError> {
        Ok(list_segments(&self.dir)?
            .into_iter()
            .map(|segment| segment_path(&self.dir, segment))
            .collect())
    }

    /// Force the open segment to disk.
    pub fn flush(&mut self) -> Result<(), LogError> {
        if let Some(writer) = self.writer.as_mut() {
            writer.file.sync_all()?;
        }
        Ok(())
    }

    /// Delete whole segments whose records are all `<= through`.
    ///
    /// The newest segment is always kept so the tail survives a reopen.
    /// Returns the number of segments removed.
    pub fn prune_through(&mut self, through: SequenceNumber) -> Result<usize, LogError> {
        if self.read_only {
            return Err(LogError::ReadOnly(self.dir.clone()));
        }
        let Some(newest) = self.slots.last().map(|slot| slot.segment) else {
            return Ok(0);
        };

        let mut removable: Vec<u64> = Vec::new();
        for slot in &self.slots {
            if slot.segment == newest {
                break;
            }
            if removable.last() != Some(&slot.segment) {
                removable.push(slot.segment);
            }
        }
        removable.retain(|segment| {
            self.slots
                .iter()
                .filter(|slot| slot.segment == *segment)
                .all(|slot| slot.sequence <= through)
        });

        for segment in &removable {
            fs::remove_file(segment_path(&self.dir, *segment))?;
        }
        self.slots.retain(|slot| !removable.contains(&slot.segment));

        if !removable.is_empty() {
            log::info!(
                "Pruned {} segment(s) from {}; first retained sequence is now {}",
                removable.len(),
                self.dir.display(),
                self.first_retained()
            );
        }
        Ok(removable.len())
    }
}

/// Finite, restartable iterator over a snapshot of the log.
///
/// Each item is read from disk when requested. A record that fails
/// verification yields `Err(LogError::CorruptEntry)` and iteration moves
/// on to the next record.
pub struct ReplayIter {
    dir: PathBuf,
    slots: Vec<Slot>,
    pos: usize,
    reader: Option<(u64, File)>,
}

impl ReplayIter {
    /// Restart from the first event of the snapshot.
    pub fn rewind(&mut self) {
        self.pos = 0;
    }

    /// Sequence number of the last event in the snapshot.
    pub fn last_sequence(&self) -> Option<SequenceNumber> {
        self.slots.last().map(|slot| slot.sequence)
    }

    fn read_slot(&mut self, slot: Slot) -> Result<SessionEvent, LogError> {
        let mut file = match self.reader.take() {
            Some((segment, file)) if segment == slot.segment => file,
            _ => File::open(segment_path(&self.dir, slot.segment))?,
        };

        let mut buf = vec![0u8; slot.len];
        file.seek(SeekFrom::Start(slot.offset))?;
        file.read_exact(&mut buf)?;
        self.reader = Some((slot.segment, file));

        let event = record::decode_record(&buf).map_err(|reason| LogError::CorruptEntry {
            sequence: slot.sequence,
            reason,
        })?;
        if event.sequence != slot.sequence {
            return Err(LogError::CorruptEntry {
                sequence: slot.sequence,
                reason: RecordError::Decode(format!(
                    "record holds sequence {}, index expects {}",
                    event.sequence, slot.sequence
                )),
            });
        }
        Ok(event)
    }
}

impl Iterator for ReplayIter {
    type Item = Result<SessionEvent, LogError>;

    fn next(&mut self) -> Option<Self::Item> {
        let slot = *self.slots.get(self.pos)?;
        self.pos += 1;
        Some(self.read_slot(slot))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.slots.len() - self.pos;
        (remaining, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventPayload;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn tx(bytes: &[u8]) -> PendingEvent {
        PendingEvent::transaction(Uuid::new_v4(), bytes.to_vec())
    }

    fn collect_ok(iter: ReplayIter) -> Vec<SessionEvent> {
        iter.map(|r| r.unwrap()).collect()
    }

    fn sequences(iter: ReplayIter) -> Vec<SequenceNumber> {
        iter.map(|r| r.unwrap().sequence).collect()
    }

    /// Overwrite the length header of the `nth` record (0-based) in `path`.
    fn corrupt_length(path: &Path, nth: usize, len: u32) {
        let mut bytes = fs::read(path).unwrap();
        let mut offset = 0;
        for _ in 0..nth {
            offset += record::framed_len(&bytes[offset..]).unwrap();
        }
        bytes[offset..offset + 4].copy_from_slice(&len.to_le_bytes());
        fs::write(path, &bytes).unwrap();
    }

    /// Sequence numbers of readable entries plus those reported corrupt.
    fn replay_outline(log: &EventLog) -> (Vec<SequenceNumber>, Vec<SequenceNumber>) {
        let mut ok = Vec::new();
        let mut corrupt = Vec::new();
        for item in log.read_from(log.first_retained()).unwrap() {
            match item {
                Ok(event) => ok.push(event.sequence),
                Err(LogError::CorruptEntry { sequence, .. }) => corrupt.push(sequence),
                Err(e) => panic!("unexpected replay error: {e}"),
            }
        }
        (ok, corrupt)
    }

    #[test]
    fn test_append_assigns_from_one() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open(dir.path(), LogConfig::for_testing()).unwrap();
        assert_eq!(log.tail(), 0);
        assert!(log.is_empty());

        for expected in 1..=10 {
            let event = log.append(tx(b"op"), Utc::now()).unwrap();
            assert_eq!(event.sequence, expected);
        }
        assert_eq!(log.tail(), 10);
        assert_eq!(log.len(), 10);
        // segment_size 4 → segments 0, 1, 2
        assert_eq!(log.segment_files().unwrap().len(), 3);
    }

    #[test]
    fn test_reopen_restores_tail_and_packages() {
        let dir = tempdir().unwrap();
        let origin = Uuid::new_v4();
        {
            let mut log = EventLog::open(dir.path(), LogConfig::for_testing()).unwrap();
            log.append(tx(b"a"), Utc::now()).unwrap();
            let p1 = log
                .append(PendingEvent::package(origin, "/Game/Map", EventPayload::Inline(vec![1])), Utc::now())
                .unwrap();
            let p2 = log
                .append(PendingEvent::package(origin, "/Game/Map", EventPayload::Inline(vec![2])), Utc::now())
                .unwrap();
            assert_eq!(p1.package.unwrap().revision, 1);
            assert_eq!(p2.package.unwrap().revision, 2);
        }

        let mut log = EventLog::open(dir.path(), LogConfig::for_testing()).unwrap();
        assert_eq!(log.tail(), 3);
        assert_eq!(log.package_head_revision("/Game/Map"), 2);
        assert_eq!(log.package_head_revision("/Game/Other"), 0);

        let next = log.append(tx(b"b"), Utc::now()).unwrap();
        assert_eq!(next.sequence, 4);
    }

    #[test]
    fn test_package_event_requires_name() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open(dir.path(), LogConfig::for_testing()).unwrap();
        let pending = PendingEvent::new(Uuid::new_v4(), EventKind::Package, EventPayload::Inline(vec![]));
        assert!(matches!(log.append(pending, Utc::now()), Err(LogError::MissingPackageName)));
        assert_eq!(log.tail(), 0);
    }

    #[test]
    fn test_read_from_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open(dir.path(), LogConfig::for_testing()).unwrap();
        for i in 0..9u8 {
            log.append(tx(&[i; 100]), Utc::now()).unwrap();
        }

        let first = collect_ok(log.read_from(3).unwrap());
        let second = collect_ok(log.read_from(3).unwrap());
        assert_eq!(first, second);
        assert_eq!(
            first.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            (3..=9).collect::<Vec<_>>()
        );

        let mut iter = log.read_from(8).unwrap();
        assert_eq!(iter.size_hint(), (2, Some(2)));
        let once: Vec<_> = iter.by_ref().map(|r| r.unwrap()).collect();
        iter.rewind();
        let again: Vec<_> = iter.map(|r| r.unwrap()).collect();
        assert_eq!(once, again);
    }

    #[test]
    fn test_read_from_zero_and_past_tail() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open(dir.path(), LogConfig::for_testing()).unwrap();
        assert_eq!(log.read_from(0).unwrap().count(), 0);

        log.append(tx(b"a"), Utc::now()).unwrap();
        log.append(tx(b"b"), Utc::now()).unwrap();
        assert_eq!(log.read_from(0).unwrap().count(), 2);
        assert_eq!(log.read_from(3).unwrap().count(), 0);
    }

    #[test]
    fn test_snapshot_excludes_later_appends() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open(dir.path(), LogConfig::for_testing()).unwrap();
        log.append(tx(b"a"), Utc::now()).unwrap();
        let iter = log.read_from(1).unwrap();
        log.append(tx(b"b"), Utc::now()).unwrap();
        assert_eq!(iter.last_sequence(), Some(1));
        assert_eq!(iter.count(), 1);
    }

    #[test]
    fn test_corrupt_entry_skipped_during_replay() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open(dir.path(), LogConfig::for_testing()).unwrap();
        for i in 0..3u8 {
            log.append(tx(&[i; 32]), Utc::now()).unwrap();
        }
        drop(log);

        // Flip a body byte of the second record in segment 0
        let path = segment_path(dir.path(), 0);
        let mut bytes = fs::read(&path).unwrap();
        let first_len = record::framed_len(&bytes).unwrap();
        bytes[first_len + record::HEADER_LEN + 3] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let log = EventLog::open(dir.path(), LogConfig::for_testing()).unwrap();
        assert_eq!(log.tail(), 3);
        assert_eq!(log.corrupt_on_open(), 1);

        let results: Vec<_> = log.read_from(1).unwrap().collect();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_ref().unwrap().sequence, 1);
        assert!(matches!(results[1], Err(LogError::CorruptEntry { sequence: 2, .. })));
        assert_eq!(results[2].as_ref().unwrap().sequence, 3);
    }

    #[test]
    fn test_partial_tail_truncated_on_open() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open(dir.path(), LogConfig::for_testing()).unwrap();
        log.append(tx(b"a"), Utc::now()).unwrap();
        log.append(tx(b"b"), Utc::now()).unwrap();
        drop(log);

        let path = segment_path(dir.path(), 0);
        let full = fs::read(&path).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        // Half of a third record: crash mid-write
        file.write_all(&full[..10]).unwrap();
        drop(file);

        let mut log = EventLog::open(dir.path(), LogConfig::for_testing()).unwrap();
        assert_eq!(log.tail(), 2);
        assert_eq!(fs::metadata(&path).unwrap().len(), full.len() as u64);

        let next = log.append(tx(b"c"), Utc::now()).unwrap();
        assert_eq!(next.sequence, 3);
        assert_eq!(collect_ok(log.read_from(1).unwrap()).len(), 3);
    }

    #[test]
    fn test_bad_length_in_newest_segment_keeps_later_records() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open(dir.path(), LogConfig::for_testing()).unwrap();
        for i in 0..4u8 {
            log.append(tx(&[i; 24]), Utc::now()).unwrap();
        }
        drop(log);

        let path = segment_path(dir.path(), 0);
        let size = fs::metadata(&path).unwrap().len();
        corrupt_length(&path, 1, 0x00FF_FFFF);

        let mut log = EventLog::open(dir.path(), LogConfig::for_testing()).unwrap();
        assert_eq!(log.tail(), 4);
        assert_eq!(log.corrupt_on_open(), 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), size);
        assert_eq!(replay_outline(&log), (vec![1, 3, 4], vec![2]));

        // Nothing after the damage is handed out again
        assert_eq!(log.append(tx(b"next"), Utc::now()).unwrap().sequence, 5);
    }

    #[test]
    fn test_bad_length_in_sealed_segment_reports_gap() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open(dir.path(), LogConfig::for_testing()).unwrap();
        for i in 0..8u8 {
            log.append(tx(&[i; 24]), Utc::now()).unwrap();
        }
        drop(log);

        // Record 2 sits in segment 0; segment 1 holds 5..=8
        corrupt_length(&segment_path(dir.path(), 0), 1, 0x00FF_FFFF);

        let mut log = EventLog::open(dir.path(), LogConfig::for_testing()).unwrap();
        assert_eq!(log.tail(), 8);
        assert_eq!(replay_outline(&log), (vec![1, 3, 4, 5, 6, 7, 8], vec![2]));
        assert_eq!(log.append(tx(b"next"), Utc::now()).unwrap().sequence, 9);
    }

    #[test]
    fn test_short_length_resyncs_on_footer() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open(dir.path(), LogConfig::for_testing()).unwrap();
        for i in 0..3u8 {
            log.append(tx(&[i; 24]), Utc::now()).unwrap();
        }
        drop(log);

        // Fits in the file but lands mid-record
        corrupt_length(&segment_path(dir.path(), 0), 0, 3);

        let log = EventLog::open(dir.path(), LogConfig::for_testing()).unwrap();
        assert_eq!(log.tail(), 3);
        assert_eq!(replay_outline(&log), (vec![2, 3], vec![1]));
    }

    #[test]
    fn test_damaged_footer_keeps_following_record() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open(dir.path(), LogConfig::for_testing()).unwrap();
        for i in 0..3u8 {
            log.append(tx(&[i; 24]), Utc::now()).unwrap();
        }
        drop(log);

        let path = segment_path(dir.path(), 0);
        let mut bytes = fs::read(&path).unwrap();
        let first = record::framed_len(&bytes).unwrap();
        let second = record::framed_len(&bytes[first..]).unwrap();
        bytes[first + second - 1] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let log = EventLog::open(dir.path(), LogConfig::for_testing()).unwrap();
        assert_eq!(log.tail(), 3);
        assert_eq!(replay_outline(&log), (vec![1, 3], vec![2]));
    }

    #[test]
    fn test_read_only_open_never_truncates() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open(dir.path(), LogConfig::for_testing()).unwrap();
        log.append(tx(b"a"), Utc::now()).unwrap();
        log.append(tx(b"b"), Utc::now()).unwrap();
        drop(log);

        let path = segment_path(dir.path(), 0);
        let full = fs::read(&path).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&full[..10]).unwrap();
        drop(file);
        let torn = fs::metadata(&path).unwrap().len();

        let mut log = EventLog::open_read_only(dir.path(), LogConfig::for_testing()).unwrap();
        assert!(log.is_read_only());
        assert_eq!(log.tail(), 2);
        assert_eq!(fs::metadata(&path).unwrap().len(), torn);
        assert!(matches!(log.append(tx(b"c"), Utc::now()), Err(LogError::ReadOnly(_))));
        assert!(matches!(log.prune_through(1), Err(LogError::ReadOnly(_))));
        assert_eq!(fs::metadata(&path).unwrap().len(), torn);

        assert!(matches!(
            EventLog::open_read_only(dir.path().join("missing"), LogConfig::for_testing()),
            Err(LogError::Io(_))
        ));
    }

    #[test]
    fn test_package_revisions_and_live_transactions() {
        let dir = tempdir().unwrap();
        let origin = Uuid::new_v4();
        let save = |bytes: Vec<u8>| PendingEvent::package(origin, "/Game/Map", EventPayload::Inline(bytes));
        let edit = |name: &str| PendingEvent::transaction(origin, b"edit".to_vec()).with_package_name(name);
        {
            let mut log = EventLog::open(dir.path(), LogConfig::for_testing()).unwrap();
            log.append(save(vec![1]), Utc::now()).unwrap();
            let before_save = log.append(edit("/Game/Map"), Utc::now()).unwrap();
            assert_eq!(
                before_save.package,
                Some(PackageRef {
                    name: "/Game/Map".into(),
                    revision: 1
                })
            );
            log.append(save(vec![2]), Utc::now()).unwrap();
            log.append(edit("/Game/Map"), Utc::now()).unwrap();
            log.append(edit("/Game/Unsaved"), Utc::now()).unwrap();
        }

        // Everything below is rebuilt from disk
        let log = EventLog::open(dir.path(), LogConfig::for_testing()).unwrap();
        assert_eq!(log.package_head_revision("/Game/Map"), 2);
        assert_eq!(log.package_head_revision("/Game/Unsaved"), 0);
        assert_eq!(log.live_transactions("/Game/Map"), vec![4]);
        assert_eq!(log.live_transactions("/Game/Unsaved"), vec![5]);
        assert!(log.live_transactions("/Game/Nothing").is_empty());
        assert_eq!(
            log.packages_with_live_transactions(),
            vec!["/Game/Map".to_string(), "/Game/Unsaved".to_string()]
        );

        let first = log.package_event("/Game/Map", Some(1)).unwrap().unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(first.payload.as_inline(), Some(&[1u8][..]));
        let head = log.package_event("/Game/Map", None).unwrap().unwrap();
        assert_eq!(head.sequence, 3);
        assert!(log.package_event("/Game/Map", Some(9)).unwrap().is_none());
        assert!(log.package_event("/Game/Unsaved", None).unwrap().is_none());

        assert_eq!(
            log.head_packages(),
            vec![PackageRef {
                name: "/Game/Map".into(),
                revision: 2
            }]
        );
        assert_eq!(sequences(log.head_package_events()), vec![3]);
    }

    #[test]
    fn test_activities_by_kind_and_range() {
        let dir = tempdir().unwrap();
        let origin = Uuid::new_v4();
        let lock = |activity: LockActivity| {
            PendingEvent::new(origin, EventKind::Lock, EventPayload::Inline(activity.encode().unwrap()))
        };
        let mut log = EventLog::open(dir.path(), LogConfig::for_testing()).unwrap();
        log.append(tx(b"a"), Utc::now()).unwrap();
        log.append(lock(LockActivity::acquire(["/Game/Map.Cube", "/Game/Map.Light"])), Utc::now())
            .unwrap();
        log.append(tx(b"b"), Utc::now()).unwrap();
        log.append(lock(LockActivity::release(["/Game/Map.Cube"])), Utc::now()).unwrap();
        // Opaque lock bodies are stored but not indexed
        log.append(PendingEvent::new(origin, EventKind::Lock, EventPayload::Inline(vec![0xFF])), Utc::now())
            .unwrap();

        assert_eq!(sequences(log.activities(1, 10, Some(EventKind::Lock))), vec![2, 4, 5]);
        assert_eq!(sequences(log.activities(3, 10, Some(EventKind::Transaction))), vec![3]);
        assert_eq!(sequences(log.activities(2, 2, None)), vec![2, 3]);
        assert_eq!(log.activities(6, 10, None).count(), 0);

        assert_eq!(log.lock_events_for("/Game/Map.Cube"), vec![2, 4]);
        assert_eq!(log.lock_events_for("/Game/Map.Light"), vec![2]);
        assert!(log.lock_events_for("/Game/Map.Other").is_empty());

        assert_eq!(log.read_event(3).unwrap().unwrap().payload.as_inline(), Some(&b"b"[..]));
        assert!(log.read_event(42).unwrap().is_none());
    }

    #[test]
    fn test_prune_then_read_older_is_not_found() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open(dir.path(), LogConfig::for_testing()).unwrap();
        for _ in 0..10 {
            log.append(tx(b"x"), Utc::now()).unwrap();
        }

        // Segments: [1-4] [5-8] [9-10]; pruning through 6 removes only the first
        assert_eq!(log.prune_through(6).unwrap(), 1);
        assert_eq!(log.first_retained(), 5);
        assert!(matches!(
            log.read_from(2),
            Err(LogError::NotFound { requested: 2, first_retained: 5 })
        ));
        assert_eq!(log.read_from(5).unwrap().count(), 6);

        // Newest segment survives even a full prune
        log.prune_through(100).unwrap();
        drop(log);
        let log = EventLog::open(dir.path(), LogConfig::for_testing()).unwrap();
        assert_eq!(log.tail(), 10);
        assert_eq!(log.first_retained(), 9);
    }

    #[test]
    fn test_failed_append_consumes_nothing() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open(dir.path(), LogConfig::for_testing()).unwrap();
        for _ in 0..4 {
            log.append(tx(b"x"), Utc::now()).unwrap();
        }
        // Block creation of segment 1
        fs::create_dir(segment_path(dir.path(), 1)).unwrap();

        assert!(matches!(log.append(tx(b"y"), Utc::now()), Err(LogError::Io(_))));
        assert_eq!(log.tail(), 4);

        fs::remove_dir(segment_path(dir.path(), 1)).unwrap();
        assert_eq!(log.append(tx(b"y"), Utc::now()).unwrap().sequence, 5);
    }

    #[test]
    fn test_append_sequenced_allows_gaps_only_forward() {
        let dir = tempdir().unwrap();
        let mut log = EventLog::open(dir.path(), LogConfig::for_testing()).unwrap();
        let event = tx(b"a").into_event(7, Utc::now(), None);
        log.append_sequenced(&event).unwrap();
        assert_eq!(log.tail(), 7);

        let stale = tx(b"b").into_event(7, Utc::now(), None);
        assert!(matches!(
            log.append_sequenced(&stale),
            Err(LogError::OutOfOrder { sequence: 7, tail: 7 })
        ));
        assert_eq!(collect_ok(log.read_from(7).unwrap()), vec![event]);
    }
}
