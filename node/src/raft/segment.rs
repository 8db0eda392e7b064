use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const HEADER_SIZE: u64 = 16; // 8 bytes for start_index + 8 bytes for end_index
const ENTRY_HEADER_SIZE: u64 = 8; // 8 bytes for entry size

/// One append-only file of length-prefixed entry records. Entries are
/// stored in strictly consecutive index order starting at `start_index`.
#[derive(Debug)]
pub struct Segment {
    file: File,
    start_index: u64,
    end_index: u64,
    path: PathBuf,
    entry_positions: BTreeMap<u64, u64>, // index -> file position
}

#[derive(Debug, Serialize, Deserialize)]
struct SegmentHeader {
    start_index: u64,
    end_index: u64,
}

impl Segment {
    pub fn open<P: AsRef<Path>>(path: P, start_index: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut segment = Segment {
            file,
            start_index,
            end_index: start_index.saturating_sub(1),
            path: path.as_ref().to_path_buf(),
            entry_positions: BTreeMap::new(),
        };

        if segment.file.metadata()?.len() == 0 {
            segment.write_header()?;
        } else {
            segment.read_header()?;
            segment.rebuild_entry_positions()?;
        }

        Ok(segment)
    }

    fn write_header(&mut self) -> io::Result<()> {
        let header = SegmentHeader {
            start_index: self.start_index,
            end_index: self.end_index,
        };

        let header_bytes =
            bincode::serialize(&header).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header_bytes)?;
        Ok(())
    }

    fn read_header(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut header_bytes = vec![0u8; HEADER_SIZE as usize];
        self.file.read_exact(&mut header_bytes)?;

        let header: SegmentHeader = bincode::deserialize(&header_bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        self.start_index = header.start_index;
        self.end_index = header.end_index;
        Ok(())
    }

    fn read_entry_header(&mut self) -> io::Result<u64> {
        let mut size_bytes = [0u8; 8];
        self.file.read_exact(&mut size_bytes)?;
        Ok(u64::from_le_bytes(size_bytes))
    }

    fn rebuild_entry_positions(&mut self) -> io::Result<()> {
        self.entry_positions.clear();
        let file_len = self.file.metadata()?.len();
        let mut pos = HEADER_SIZE;
        let mut index = self.start_index;

        while pos < file_len && index <= self.end_index {
            self.file.seek(SeekFrom::Start(pos))?;
            let entry_size = self.read_entry_header()?;
            self.entry_positions.insert(index, pos);
            pos += ENTRY_HEADER_SIZE + entry_size;
            index += 1;
        }

        // drop a torn tail left by a crash mid-append
        if pos < file_len {
            self.file.set_len(pos)?;
        }

        Ok(())
    }

    pub fn append(&mut self, entries: &[Vec<u8>]) -> io::Result<()> {
        let mut pos = self.file.seek(SeekFrom::End(0))?;

        for entry in entries {
            self.file.write_all(&(entry.len() as u64).to_le_bytes())?;
            self.file.write_all(entry)?;

            let entry_index = self.end_index.wrapping_add(1);
            self.entry_positions.insert(entry_index, pos);
            self.end_index = entry_index;
            pos += ENTRY_HEADER_SIZE + entry.len() as u64;
        }

        self.write_header()?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn read_entry(&mut self, index: u64) -> io::Result<Vec<u8>> {
        if index < self.start_index || index > self.end_index {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "index out of range",
            ));
        }

        let pos = self
            .entry_positions
            .get(&index)
            .copied()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "entry position not found"))?;

        self.file.seek(SeekFrom::Start(pos))?;
        let entry_size = self.read_entry_header()?;

        let mut entry = vec![0u8; entry_size as usize];
        self.file.read_exact(&mut entry)?;
        Ok(entry)
    }

    /// Drops every entry with index > `index`. Overwritten log suffixes
    /// are removed before their replacements are appended.
    pub fn truncate_after(&mut self, index: u64) -> io::Result<()> {
        if index >= self.end_index {
            return Ok(());
        }
        if index < self.start_index {
            // the whole segment is being overwritten
            self.file.set_len(HEADER_SIZE)?;
            self.entry_positions.clear();
            self.end_index = self.start_index.saturating_sub(1);
            self.write_header()?;
            self.file.sync_data()?;
            return Ok(());
        }

        if let Some(pos) = self.entry_positions.get(&(index + 1)).copied() {
            self.file.set_len(pos)?;
            self.end_index = index;
            self.write_header()?;
            self.file.sync_data()?;

            while let Some((&idx, _)) = self.entry_positions.range(index + 1..).next() {
                self.entry_positions.remove(&idx);
            }
        }

        Ok(())
    }

    /// Removes the backing file. The segment must not be used afterwards.
    pub fn remove(self) -> io::Result<()> {
        fs::remove_file(&self.path)
    }

    pub fn start_index(&self) -> u64 {
        self.start_index
    }

    pub fn end_index(&self) -> u64 {
        self.end_index
    }

    pub fn is_empty(&self) -> bool {
        self.end_index < self.start_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_segment_creation() {
        let temp_file = NamedTempFile::new().unwrap();
        let segment = Segment::open(temp_file.path(), 1).unwrap();

        assert_eq!(segment.start_index(), 1);
        assert_eq!(segment.end_index(), 0);
        assert!(segment.is_empty());
    }

    #[test]
    fn test_segment_append_and_read() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut segment = Segment::open(temp_file.path(), 1).unwrap();

        let entries = vec![b"first entry".to_vec(), b"second entry".to_vec()];
        segment.append(&entries).unwrap();

        assert_eq!(segment.end_index(), 2);
        assert!(!segment.is_empty());

        assert_eq!(segment.read_entry(1).unwrap(), b"first entry");
        assert_eq!(segment.read_entry(2).unwrap(), b"second entry");
    }

    #[test]
    fn test_segment_truncate() {
        let temp_file = NamedTempFile::new().unwrap();
        let mut segment = Segment::open(temp_file.path(), 1).unwrap();

        let entries = vec![
            b"first entry".to_vec(),
            b"second entry".to_vec(),
            b"third entry".to_vec(),
        ];
        segment.append(&entries).unwrap();

        segment.truncate_after(2).unwrap();
        assert_eq!(segment.end_index(), 2);

        assert_eq!(segment.read_entry(1).unwrap(), b"first entry");
        assert_eq!(segment.read_entry(2).unwrap(), b"second entry");
        assert!(segment.read_entry(3).is_err());

        // replacement entries continue after the cut
        segment.append(&[b"third entry again".to_vec()]).unwrap();
        assert_eq!(segment.read_entry(3).unwrap(), b"third entry again");
    }

    #[test]
    fn test_segment_reopen() {
        let temp_file = NamedTempFile::new().unwrap();
        {
            let mut segment = Segment::open(temp_file.path(), 5).unwrap();
            segment
                .append(&[b"five".to_vec(), b"six".to_vec()])
                .unwrap();
        }

        let mut segment = Segment::open(temp_file.path(), 5).unwrap();
        assert_eq!(segment.start_index(), 5);
        assert_eq!(segment.end_index(), 6);
        assert_eq!(segment.read_entry(6).unwrap(), b"six");
    }
}
