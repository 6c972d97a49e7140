use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Read exactly `buf.len()` bytes. `Ok(false)` on a clean or torn end of file.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Decode the next entry and its encoded size. `Ok(None)` stops replay: end
/// of file, a torn trailing entry, a CRC mismatch or an undecodable payload.
fn decode_next(reader: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut len_buf = [0u8; 4];
    if !read_full(reader, &mut len_buf)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut payload = vec![0u8; len];
    if !read_full(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_full(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize::<Event>(&payload)
        .ok()
        .map(|event| (event, (len + 8) as u64)))
}

/// File length and append counter at a batch boundary, for [`Wal::rollback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    len: u64,
    appends: u64,
}

/// Append-only write-ahead log of reservation events.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A torn last entry (crash mid-write) is discarded on replay.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Append and fsync a single event. Production code goes through
    /// `append_buffered` + `flush_sync` for group commit.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Append to the BufWriter without flushing or syncing.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write compacted events to `<path>.wal.tmp` and fsync.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Atomic swap: rename the temp file over the WAL and reopen.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
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

    /// Mark the current end of the log. Only valid with an empty write
    /// buffer, i.e. right after `open` or `flush_sync`.
    pub fn checkpoint(&self) -> io::Result<Checkpoint> {
        Ok(Checkpoint {
            len: self.writer.get_ref().metadata()?.len(),
            appends: self.appends_since_compact,
        })
    }

    /// Drop everything written or buffered since `checkpoint`.
    pub fn rollback(&mut self, checkpoint: Checkpoint) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        file.set_len(checkpoint.len)?;
        file.sync_all()?;
        let stale = std::mem::replace(&mut self.writer, BufWriter::new(file));
        // Buffered bytes belong to the abandoned batch; never flush them
        let _ = stale.into_parts();
        self.appends_since_compact = checkpoint.appends;
        Ok(())
    }

    /// Replay the WAL from disk, returning every valid event up to the first
    /// torn or corrupt entry. A missing file replays as empty.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(Self::replay_valid(path)?.0)
    }

    /// Replay, then cut the file back to the last valid entry so later
    /// appends are not stranded behind a torn or corrupt one.
    pub fn recover(path: &Path) -> io::Result<Vec<Event>> {
        let (events, valid_len) = Self::replay_valid(path)?;
        let file = match OpenOptions::new().write(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(events),
            Err(e) => return Err(e),
        };
        let on_disk = file.metadata()?.len();
        if on_disk > valid_len {
            warn!(
                "discarding {} trailing bytes of {} after {} valid events",
                on_disk - valid_len,
                path.display(),
                events.len()
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Ok(events)
    }

    fn replay_valid(path: &Path) -> io::Result<(Vec<Event>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut valid_len = 0u64;
        while let Some((event, size)) = decode_next(&mut reader)? {
            events.push(event);
            valid_len += size;
        }
        Ok((events, valid_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ResourceKind, SessionStatus, Span};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("roster_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn room_created() -> Event {
        Event::ResourceCreated {
            id: Ulid::new(),
            kind: ResourceKind::Room,
            name: Some("Studio A".into()),
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let trainer = Ulid::new();
        let events = vec![
            room_created(),
            Event::ResourceCreated {
                id: trainer,
                kind: ResourceKind::Trainer,
                name: None,
            },
            Event::WindowDeclared {
                id: Ulid::new(),
                trainer_id: trainer,
                span: Span::new(1000, 2000),
            },
        ];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn replay_discards_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let event = room_created();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8, 0, 0, 0, 1, 2]).unwrap(); // length says 7, only 2 follow
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_stops_at_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        let good = room_created();
        let bad = Event::MemberEnrolled {
            member_id: Ulid::new(),
            activity_id: Ulid::new(),
        };
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&good).unwrap();
        }
        {
            let payload = bincode::serialize(&bad).unwrap();
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![good]);
    }

    #[test]
    fn compact_replaces_history() {
        let path = tmp_path("compact_history.wal");
        let room = room_created();
        let session = Ulid::new();
        let room_id = Ulid::new();
        let trainer_id = Ulid::new();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&room).unwrap();
            for _ in 0..10 {
                let activity_id = Ulid::new();
                let member_id = Ulid::new();
                wal.append(&Event::MemberEnrolled { member_id, activity_id }).unwrap();
                wal.append(&Event::MemberUnenrolled { member_id, activity_id }).unwrap();
            }
            wal.append(&Event::SessionTransitioned {
                id: session,
                trainer_id,
                room_id,
                status: SessionStatus::Cancelled,
            })
            .unwrap();
        }
        let before = fs::metadata(&path).unwrap().len();

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(std::slice::from_ref(&room)).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
        }

        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");
        assert_eq!(Wal::replay(&path).unwrap(), vec![room]);
    }

    #[test]
    fn append_after_compact_lands_in_new_file() {
        let path = tmp_path("append_after_compact.wal");
        let room = room_created();
        let later = room_created();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&room).unwrap();
            wal.compact(std::slice::from_ref(&room)).unwrap();
            wal.append(&later).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![room, later]);
    }

    #[test]
    fn buffered_appends_visible_after_flush() {
        let path = tmp_path("buffered_flush.wal");
        let events: Vec<Event> = (0..5).map(|_| room_created()).collect();
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn recover_cuts_torn_tail_so_later_appends_survive() {
        let path = tmp_path("recover_torn_tail.wal");
        let first = room_created();
        let later = room_created();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        let valid_len = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8, 0, 0, 0, 1, 2]).unwrap();
        }

        assert_eq!(Wal::recover(&path).unwrap(), vec![first.clone()]);
        assert_eq!(fs::metadata(&path).unwrap().len(), valid_len);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&later).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![first, later]);
    }

    #[test]
    fn recover_missing_file_is_empty() {
        let path = tmp_path("recover_missing.wal");
        assert!(Wal::recover(&path).unwrap().is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn rollback_discards_flushed_and_buffered_batch() {
        let path = tmp_path("rollback_batch.wal");
        let kept = room_created();
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&kept).unwrap();

        let checkpoint = wal.checkpoint().unwrap();
        wal.append_buffered(&room_created()).unwrap();
        wal.flush_sync().unwrap();
        wal.append_buffered(&room_created()).unwrap();
        assert_eq!(wal.appends_since_compact(), 3);

        wal.rollback(checkpoint).unwrap();
        assert_eq!(wal.appends_since_compact(), 1);
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept.clone()]);

        let next = room_created();
        wal.append(&next).unwrap();
        drop(wal);
        assert_eq!(Wal::replay(&path).unwrap(), vec![kept, next]);
    }
}
