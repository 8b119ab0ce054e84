use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// Largest payload a record may carry. A length prefix above this is read
/// as corruption rather than allocated.
pub const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_RECORD_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("WAL record of {} bytes exceeds {MAX_RECORD_LEN}", payload.len()),
        ));
    }
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Read exactly `buf.len()` bytes. `Ok(false)` means the file ended first.
fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Append-only Write-Ahead Log backing the document store.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A torn last entry (crash mid-write) is discarded on replay via the
///   length prefix and CRC check.
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

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event without syncing. `flush_sync()` commits the batch.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Write the compacted event list to `<wal>.tmp` and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the compacted temp file over the live WAL and reopen it.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Replay the WAL from disk, returning all valid events in write order.
    /// Replay stops at the first truncated or corrupt entry.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(scan(path)?.0)
    }

    /// Replay, cut any torn or corrupt tail off the file, then open it for
    /// appending. New records land directly after the last valid one.
    pub fn recover(path: &Path) -> io::Result<(Vec<Event>, Self)> {
        let (events, valid_len) = scan(path)?;
        match fs::metadata(path) {
            Ok(meta) if meta.len() > valid_len => {
                warn!(
                    "WAL {}: discarding {} bytes after {} events",
                    path.display(),
                    meta.len() - valid_len,
                    events.len()
                );
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        Ok((events, Self::open(path)?))
    }
}

/// Valid events plus the byte length they occupy at the head of the file.
fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut valid_len = 0u64;

    loop {
        let mut len_buf = [0u8; 4];
        if !read_or_eof(&mut reader, &mut len_buf)? {
            break;
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_RECORD_LEN {
            warn!("WAL {}: record length {len} after {} events, truncating replay", path.display(), events.len());
            break;
        }
        let mut payload = vec![0u8; len];
        if !read_or_eof(&mut reader, &mut payload)? {
            break;
        }
        let mut crc_buf = [0u8; 4];
        if !read_or_eof(&mut reader, &mut crc_buf)? {
            break;
        }
        if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
            warn!("WAL {}: crc mismatch after {} events, truncating replay", path.display(), events.len());
            break;
        }
        match bincode::deserialize::<Event>(&payload) {
            Ok(event) => events.push(event),
            Err(_) => break,
        }
        valid_len += (4 + len + 4) as u64;
    }

    Ok((events, valid_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("reservd_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn room_created(name: &str) -> (Ulid, Event) {
        let id = Ulid::new();
        let event = Event::RoomCreated {
            room: Room {
                id,
                name: name.into(),
                capacity: 6,
                status: RoomStatus::Available,
            },
        };
        (id, event)
    }

    fn booked(room_id: Ulid, start: Ms, end: Ms) -> Event {
        Event::ReservationCreated {
            reservation: Reservation {
                id: Ulid::new(),
                room_id,
                user: "luis".into(),
                span: Span::new(start, end),
                status: ReservationStatus::Active,
            },
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let (rid, created) = room_created("Sala A");
        let events = vec![created, booked(rid, 1_000, 2_000)];

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_handles_truncation() {
        let path = tmp_path("truncation.wal");
        let (_, event) = room_created("Sala B");

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0u8; 6]).unwrap(); // partial length + some bytes
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_corrupt_crc() {
        let path = tmp_path("corrupt_crc.wal");
        let event = Event::RoomDeleted { id: Ulid::new() };

        {
            let payload = bincode::serialize(&event).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }

        assert!(Wal::replay(&path).unwrap().is_empty());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_reduces_wal() {
        let path = tmp_path("compact_reduce.wal");
        let (rid, created) = room_created("Sala C");

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&created).unwrap();
            for i in 0..10 {
                let event = booked(rid, i * 10_000, i * 10_000 + 5_000);
                let Event::ReservationCreated { reservation } = &event else { unreachable!() };
                let id = reservation.id;
                wal.append(&event).unwrap();
                wal.append(&Event::ReservationDeleted { id, room_id: rid }).unwrap();
            }
        }

        let before = fs::metadata(&path).unwrap().len();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.compact(std::slice::from_ref(&created)).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
        }
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "compacted WAL should be smaller: {after} < {before}");

        assert_eq!(Wal::replay(&path).unwrap(), vec![created]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let (rid, created) = room_created("Sala D");
        let later = booked(rid, 5_000, 6_000);

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&created).unwrap();
            wal.compact(std::slice::from_ref(&created)).unwrap();
            wal.append(&later).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![created, later]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn append_buffered_then_flush_sync() {
        let path = tmp_path("buffered_flush.wal");
        let events: Vec<Event> = (0..5).map(|i| room_created(&format!("Sala {i}")).1).collect();

        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 5);
            wal.flush_sync().unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), events);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_cuts_torn_tail_before_appending() {
        let path = tmp_path("recover_torn.wal");
        let (rid, before) = room_created("Sala Antes");

        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&before).unwrap();
        }
        let clean_len = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[9u8, 0, 0, 0, 1, 2, 3]).unwrap();
        }

        let after = booked(rid, 1_000, 2_000);
        {
            let (events, mut wal) = Wal::recover(&path).unwrap();
            assert_eq!(events, vec![before.clone()]);
            assert_eq!(fs::metadata(&path).unwrap().len(), clean_len);
            wal.append(&after).unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap(), vec![before, after]);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_leaves_clean_file_alone() {
        let path = tmp_path("recover_clean.wal");
        let (_, event) = room_created("Sala Limpa");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        let len = fs::metadata(&path).unwrap().len();

        let (events, _wal) = Wal::recover(&path).unwrap();
        assert_eq!(events, vec![event]);
        assert_eq!(fs::metadata(&path).unwrap().len(), len);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn recover_creates_missing_file() {
        let path = tmp_path("recover_missing.wal");
        let (events, _wal) = Wal::recover(&path).unwrap();
        assert!(events.is_empty());
        assert!(path.exists());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn oversized_length_prefix_is_a_corrupt_tail() {
        let path = tmp_path("oversized_len.wal");
        let (_, event) = room_created("Sala E");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
            f.write_all(&[0u8; 16]).unwrap();
        }

        let (events, _wal) = Wal::recover(&path).unwrap();
        assert_eq!(events, vec![event]);
        let _ = fs::remove_file(&path);
    }
}
