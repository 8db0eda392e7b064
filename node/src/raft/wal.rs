//! Durable store for raft state: the node identity record, the entry log
//! and the latest snapshot. Everything the library is told has been
//! persisted goes through here before it is acknowledged.

use crate::raft::cluster::RaftIdentity;
use crate::raft::segment::Segment;
use crate::raft::{ConsensusError, Result};
use log::{debug, info};
use protobuf::Message as PbMessage;
use raft::eraftpb::{Entry, HardState, Snapshot};
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Entries per segment file before rolling over.
const SEGMENT_SPAN: u64 = 10_000;

const IDENTITY_FILE: &str = "identity";
const STATE_FILE: &str = "state";
const SNAPSHOT_FILE: &str = "snapshot";

#[derive(Debug, Serialize, Deserialize, Default, PartialEq)]
struct HsRecord {
    term: u64,
    vote: u64,
    commit: u64,
}

/// File-backed write-ahead log. Segments hold protobuf-encoded entries in
/// strictly increasing index order; the hard state and snapshot live in
/// their own slots and are replaced atomically via tmp + rename.
pub struct WalDb {
    dir: PathBuf,
    segments: BTreeMap<u64, Segment>,
    last_index: u64, // 0 when the log is empty
}

impl WalDb {
    pub fn open<P: AsRef<Path>>(base_path: P) -> Result<Self> {
        let dir = base_path.as_ref().join("raft");
        fs::create_dir_all(&dir)?;

        let mut starts: Vec<u64> = Vec::new();
        for dent in fs::read_dir(&dir)? {
            let path = dent?.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            if let Some(start) = name
                .strip_prefix("segment_")
                .and_then(|s| s.strip_suffix(".log"))
                .and_then(|s| s.parse::<u64>().ok())
            {
                starts.push(start);
            }
        }
        starts.sort_unstable();

        let mut segments = BTreeMap::new();
        let mut last_index = 0;
        for start in starts {
            let segment = Segment::open(dir.join(format!("segment_{}.log", start)), start)?;
            if !segment.is_empty() {
                last_index = segment.end_index();
            }
            segments.insert(start, segment);
        }

        Ok(WalDb {
            dir,
            segments,
            last_index,
        })
    }

    /// A node has a WAL once its identity record has been written.
    pub fn has_wal(&self) -> bool {
        self.dir.join(IDENTITY_FILE).exists()
    }

    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    // ---- identity ----

    pub fn write_identity(&self, identity: &RaftIdentity) -> Result<()> {
        if let Some(existing) = self.read_identity()? {
            if existing != *identity {
                return Err(ConsensusError::InvalidRaftIdentity);
            }
            return Ok(());
        }

        let encoded =
            bincode::serialize(identity).map_err(|_| ConsensusError::InvalidRaftIdentity)?;
        self.write_atomic(IDENTITY_FILE, &encoded)?;
        info!(
            "raft identity saved: id={} name={}",
            identity.node_id, identity.name
        );
        Ok(())
    }

    pub fn read_identity(&self) -> Result<Option<RaftIdentity>> {
        let path = self.dir.join(IDENTITY_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&path)?;
        let identity =
            bincode::deserialize(&raw).map_err(|_| ConsensusError::InvalidRaftIdentity)?;
        Ok(Some(identity))
    }

    // ---- entry log ----

    /// Persists one Ready worth of raft output: the new hard state (when
    /// present) and the appended entries. A suffix of the log overlapping
    /// the new entries' indices is truncated first; raft only re-sends a
    /// region of the log to overwrite it.
    pub fn save_entry(&mut self, hard_state: Option<HardState>, entries: &[Entry]) -> Result<()> {
        if !entries.is_empty() {
            let first = entries[0].index;
            if self.last_index >= first {
                debug!(
                    "overwriting wal suffix from index {} (last {})",
                    first, self.last_index
                );
                self.truncate_from(first)?;
            }

            for entry in entries {
                let raw = entry
                    .write_to_bytes()
                    .map_err(|e| ConsensusError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
                let segment = self.segment_for_append(entry.index)?;
                segment.append(&[raw])?;
                self.last_index = entry.index;
            }
        }

        if let Some(hs) = hard_state {
            let rec = HsRecord {
                term: hs.term,
                vote: hs.vote,
                commit: hs.commit,
            };
            let encoded = bincode::serialize(&rec)
                .map_err(|e| ConsensusError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
            self.write_atomic(STATE_FILE, &encoded)?;
        }

        Ok(())
    }

    fn segment_for_append(&mut self, index: u64) -> Result<&mut Segment> {
        let rollover = match self.segments.values().next_back() {
            Some(last) => {
                index != last.end_index() + 1 || index - last.start_index() >= SEGMENT_SPAN
            }
            None => true,
        };

        if rollover {
            let segment = Segment::open(self.dir.join(format!("segment_{}.log", index)), index)?;
            self.segments.insert(index, segment);
        }

        Ok(self.segments.values_mut().next_back().unwrap())
    }

    fn truncate_from(&mut self, first: u64) -> Result<()> {
        let doomed: Vec<u64> = self
            .segments
            .range(first..)
            .map(|(start, _)| *start)
            .collect();
        for start in doomed {
            if let Some(segment) = self.segments.remove(&start) {
                segment.remove()?;
            }
        }

        if let Some(last) = self.segments.values_mut().next_back() {
            last.truncate_after(first - 1)?;
        }
        self.last_index = first - 1;
        Ok(())
    }

    pub fn read_hard_state(&self) -> Result<HardState> {
        let path = self.dir.join(STATE_FILE);
        if !path.exists() {
            return Ok(HardState::default());
        }
        let raw = fs::read(&path)?;
        let rec: HsRecord = bincode::deserialize(&raw)
            .map_err(|e| ConsensusError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        let mut hs = HardState::default();
        hs.term = rec.term;
        hs.vote = rec.vote;
        hs.commit = rec.commit;
        Ok(hs)
    }

    // ---- snapshot slot ----

    /// Persists a snapshot. The previous snapshot stays on disk until the
    /// successor is durable; the rename is the commit point.
    pub fn write_snapshot(&mut self, snap: &Snapshot) -> Result<()> {
        let raw = snap
            .write_to_bytes()
            .map_err(|e| ConsensusError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        self.write_atomic(SNAPSHOT_FILE, &raw)?;

        // entry segments fully covered by the snapshot are no longer needed
        let index = snap.get_metadata().index;
        let doomed: Vec<u64> = self
            .segments
            .iter()
            .filter(|(_, s)| s.end_index() <= index && !s.is_empty())
            .map(|(start, _)| *start)
            .collect();
        for start in doomed {
            if let Some(segment) = self.segments.remove(&start) {
                segment.remove()?;
            }
        }

        debug!("snapshot persisted: {}", super::snap_to_string(snap));
        Ok(())
    }

    pub fn get_snapshot(&self) -> Result<Option<Snapshot>> {
        let path = self.dir.join(SNAPSHOT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&path)?;
        let snap = Snapshot::parse_from_bytes(&raw)
            .map_err(|e| ConsensusError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        Ok(Some(snap))
    }

    // ---- recovery ----

    /// Reads everything needed to restart: the identity record, the last
    /// persisted hard state and every entry past the snapshot.
    pub fn read_all(
        &mut self,
        from_snapshot: Option<&Snapshot>,
    ) -> Result<(RaftIdentity, HardState, Vec<Entry>)> {
        let identity = self
            .read_identity()?
            .ok_or(ConsensusError::InvalidRaftIdentity)?;
        let hard_state = self.read_hard_state()?;

        let snap_index = from_snapshot.map(|s| s.get_metadata().index).unwrap_or(0);
        let mut entries = Vec::new();
        let last_index = self.last_index;
        for segment in self.segments.values_mut() {
            if segment.is_empty() || segment.end_index() <= snap_index {
                continue;
            }
            let lo = segment.start_index().max(snap_index + 1);
            for index in lo..=segment.end_index().min(last_index) {
                let raw = segment.read_entry(index)?;
                let entry = Entry::parse_from_bytes(&raw).map_err(|e| {
                    ConsensusError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
                })?;
                entries.push(entry);
            }
        }

        Ok((identity, hard_state, entries))
    }

    fn write_atomic(&self, name: &str, data: &[u8]) -> Result<()> {
        let tmp = self.dir.join(format!("{}.tmp", name));
        let path = self.dir.join(name);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &path)?;
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn entry(term: u64, index: u64, data: &[u8]) -> Entry {
        let mut e = Entry::default();
        e.term = term;
        e.index = index;
        e.data = Bytes::from(data.to_vec());
        e
    }

    fn hs(term: u64, vote: u64, commit: u64) -> HardState {
        let mut h = HardState::default();
        h.term = term;
        h.vote = vote;
        h.commit = commit;
        h
    }

    #[test]
    fn identity_round_trip_and_mismatch() {
        let dir = TempDir::new().unwrap();
        let wal = WalDb::open(dir.path()).unwrap();
        assert!(!wal.has_wal());

        let identity = RaftIdentity {
            cluster_id: 42,
            node_id: 7,
            name: "alpha".into(),
        };
        wal.write_identity(&identity).unwrap();
        assert!(wal.has_wal());

        // rewriting the same identity is fine
        wal.write_identity(&identity).unwrap();

        let other = RaftIdentity {
            cluster_id: 42,
            node_id: 8,
            name: "beta".into(),
        };
        assert!(matches!(
            wal.write_identity(&other),
            Err(ConsensusError::InvalidRaftIdentity)
        ));

        assert_eq!(wal.read_identity().unwrap().unwrap(), identity);
    }

    #[test]
    fn save_and_read_all() {
        let dir = TempDir::new().unwrap();
        let identity = RaftIdentity {
            cluster_id: 1,
            node_id: 1,
            name: "alpha".into(),
        };
        {
            let mut wal = WalDb::open(dir.path()).unwrap();
            wal.write_identity(&identity).unwrap();
            wal.save_entry(
                Some(hs(1, 1, 2)),
                &[entry(1, 1, b"one"), entry(1, 2, b"two")],
            )
            .unwrap();
            wal.save_entry(None, &[entry(1, 3, b"three")]).unwrap();
        }

        let mut wal = WalDb::open(dir.path()).unwrap();
        assert_eq!(wal.last_index(), 3);
        let (id, state, entries) = wal.read_all(None).unwrap();
        assert_eq!(id, identity);
        assert_eq!(state.commit, 2);
        assert_eq!(
            entries.iter().map(|e| e.index).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(entries[2].data.as_ref(), b"three");
    }

    #[test]
    fn overlapping_append_truncates_suffix() {
        let dir = TempDir::new().unwrap();
        let mut wal = WalDb::open(dir.path()).unwrap();
        wal.write_identity(&RaftIdentity {
            cluster_id: 1,
            node_id: 1,
            name: "alpha".into(),
        })
        .unwrap();

        wal.save_entry(
            None,
            &[
                entry(1, 1, b"a"),
                entry(1, 2, b"b"),
                entry(1, 3, b"c"),
            ],
        )
        .unwrap();

        // a new leader overwrites indices 2..3 at a later term
        wal.save_entry(None, &[entry(2, 2, b"b2"), entry(2, 3, b"c2")])
            .unwrap();

        let (_, _, entries) = wal.read_all(None).unwrap();
        assert_eq!(
            entries.iter().map(|e| (e.term, e.index)).collect::<Vec<_>>(),
            vec![(1, 1), (2, 2), (2, 3)]
        );
        assert_eq!(entries[1].data.as_ref(), b"b2");
    }

    #[test]
    fn snapshot_slot_replacement() {
        let dir = TempDir::new().unwrap();
        let mut wal = WalDb::open(dir.path()).unwrap();
        assert!(wal.get_snapshot().unwrap().is_none());

        let mut snap = Snapshot::default();
        snap.mut_metadata().index = 5;
        snap.mut_metadata().term = 1;
        snap.set_data(Bytes::from(b"payload-a".to_vec()));
        wal.write_snapshot(&snap).unwrap();

        let mut snap2 = Snapshot::default();
        snap2.mut_metadata().index = 9;
        snap2.mut_metadata().term = 2;
        snap2.set_data(Bytes::from(b"payload-b".to_vec()));
        wal.write_snapshot(&snap2).unwrap();

        let loaded = wal.get_snapshot().unwrap().unwrap();
        assert_eq!(loaded.get_metadata().index, 9);
        assert_eq!(loaded.get_data(), b"payload-b");
    }

    #[test]
    fn read_all_skips_entries_covered_by_snapshot() {
        let dir = TempDir::new().unwrap();
        let mut wal = WalDb::open(dir.path()).unwrap();
        wal.write_identity(&RaftIdentity {
            cluster_id: 1,
            node_id: 1,
            name: "alpha".into(),
        })
        .unwrap();

        let entries: Vec<Entry> = (1..=6).map(|i| entry(1, i, b"x")).collect();
        wal.save_entry(Some(hs(1, 1, 6)), &entries).unwrap();

        let mut snap = Snapshot::default();
        snap.mut_metadata().index = 4;
        snap.mut_metadata().term = 1;

        let (_, _, remaining) = wal.read_all(Some(&snap)).unwrap();
        assert_eq!(
            remaining.iter().map(|e| e.index).collect::<Vec<_>>(),
            vec![5, 6]
        );
    }
}
