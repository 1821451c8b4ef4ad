// Copyright 2021 Stratus Data Systems, Inc.

//! The product-index map: a feed-scoped persistent dictionary from multicast
//! sequence index to product signature. The multicast sender appends to it
//! as it multicasts; the session engine reads it to resolve missed-product
//! lookups. The map file lives in the product queue's parent directory and
//! is named by feed.
//!
//! A map admits exactly one reader at a time; reader exclusivity is an
//! advisory lock on a sidecar file, released on drop so that abnormal
//! termination cannot leave the map wedged.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};

use crate::error::PimError;
use crate::types::{Feed, Signature, SIGNATURE_LEN};

const MAGIC: &[u8; 4] = b"UPIM";
const HEADER_SZ: u64 = 4;
const RECORD_SZ: u64 = 8 + SIGNATURE_LEN as u64;

/// Pathname of the index map for `feed` in `dir`.
pub fn map_pathname(dir: &Path, feed: Feed) -> PathBuf {
    dir.join(format!("{:08x}.pim", feed.0))
}

fn lock_pathname(dir: &Path, feed: Feed) -> PathBuf {
    dir.join(format!("{:08x}.pim.lock", feed.0))
}

/// A read-only handle on a feed's index map. Entries appended by the sender
/// after the map was opened become visible on the next lookup miss.
pub struct ProdIndexMap {
    file: File,
    lock_file: File,
    entries: BTreeMap<u64, Signature>,
    tail: u64,
    feed: Feed,
}

impl ProdIndexMap {
    /// Opens the map for `feed` in `dir` for reading. Fails with
    /// `PimError::Busy` when another reader already holds it.
    pub fn open_for_reading(
        dir: &Path,
        feed: Feed,
    ) -> Result<ProdIndexMap, PimError> {
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(lock_pathname(dir, feed))?;
        let rc = unsafe {
            libc::flock(lock_file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB)
        };
        if rc != 0 {
            return Err(PimError::Busy(feed));
        }

        let path = map_pathname(dir, feed);
        let mut file = File::open(&path)?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic).map_err(|_| {
            PimError::Corrupt(format!("{}: truncated header", path.display()))
        })?;
        if &magic != MAGIC {
            return Err(PimError::Corrupt(format!(
                "{}: bad magic {:?}",
                path.display(),
                magic
            )));
        }

        let mut map = ProdIndexMap {
            file,
            lock_file,
            entries: BTreeMap::new(),
            tail: HEADER_SZ,
            feed,
        };
        map.refresh()?;
        Ok(map)
    }

    pub fn feed(&self) -> Feed {
        self.feed
    }

    /// Reads records appended since the last refresh. A partial trailing
    /// record is left for the next refresh.
    fn refresh(&mut self) -> Result<(), PimError> {
        let len = self.file.metadata()?.len();
        let mut record = [0u8; RECORD_SZ as usize];
        while self.tail + RECORD_SZ <= len {
            self.file.seek(SeekFrom::Start(self.tail))?;
            self.file.read_exact(&mut record)?;
            let index = BigEndian::read_u64(&record[0..8]);
            let mut sig = [0u8; SIGNATURE_LEN];
            sig.copy_from_slice(&record[8..]);
            self.entries.insert(index, Signature(sig));
            self.tail += RECORD_SZ;
        }
        Ok(())
    }

    /// Resolves a multicast sequence index to a product signature.
    pub fn get(&mut self, index: u64) -> Result<Signature, PimError> {
        if let Some(sig) = self.entries.get(&index) {
            return Ok(*sig);
        }
        self.refresh()?;
        self.entries
            .get(&index)
            .copied()
            .ok_or(PimError::NoEnt(index))
    }

    /// Closes the map, releasing the reader slot. Dropping the handle has
    /// the same effect; this form exists for call sites that want to close
    /// eagerly.
    pub fn close(self) {}
}

impl Drop for ProdIndexMap {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.lock_file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// The sender-side write handle. Creates the map file when absent and
/// appends `(index, signature)` records.
pub struct ProdIndexMapWriter {
    file: File,
}

impl ProdIndexMapWriter {
    pub fn open_for_writing(
        dir: &Path,
        feed: Feed,
    ) -> Result<ProdIndexMapWriter, PimError> {
        let path = map_pathname(dir, feed);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        if len == 0 {
            file.write_all(MAGIC)?;
            file.flush()?;
        } else {
            let mut magic = [0u8; 4];
            file.read_exact(&mut magic)?;
            if &magic != MAGIC {
                return Err(PimError::Corrupt(format!(
                    "{}: bad magic {:?}",
                    path.display(),
                    magic
                )));
            }
        }

        Ok(ProdIndexMapWriter { file })
    }

    pub fn put(
        &mut self,
        index: u64,
        sig: &Signature,
    ) -> Result<(), PimError> {
        let mut record = [0u8; RECORD_SZ as usize];
        BigEndian::write_u64(&mut record[0..8], index);
        record[8..].copy_from_slice(&sig.0);
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&record)?;
        self.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use tempfile::tempdir;

    #[test]
    fn get_resolves_written_indexes() {
        let dir = tempdir().unwrap();
        let feed = Feed(0x0f);
        let mut writer =
            ProdIndexMapWriter::open_for_writing(dir.path(), feed).unwrap();
        writer.put(42, &Signature([7; 16])).unwrap();
        writer.put(43, &Signature([8; 16])).unwrap();

        let mut map =
            ProdIndexMap::open_for_reading(dir.path(), feed).unwrap();
        assert_eq!(map.get(42).unwrap(), Signature([7; 16]));
        assert_eq!(map.get(43).unwrap(), Signature([8; 16]));
        match map.get(99) {
            Err(PimError::NoEnt(99)) => (),
            other => panic!("expected NoEnt, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn reader_sees_entries_appended_after_open() {
        let dir = tempdir().unwrap();
        let feed = Feed(0x01);
        let mut writer =
            ProdIndexMapWriter::open_for_writing(dir.path(), feed).unwrap();
        writer.put(1, &Signature([1; 16])).unwrap();

        let mut map =
            ProdIndexMap::open_for_reading(dir.path(), feed).unwrap();
        assert!(map.get(2).is_err());

        writer.put(2, &Signature([2; 16])).unwrap();
        assert_eq!(map.get(2).unwrap(), Signature([2; 16]));
    }

    #[test]
    fn second_reader_is_rejected_until_close() {
        let dir = tempdir().unwrap();
        let feed = Feed(0x01);
        let mut writer =
            ProdIndexMapWriter::open_for_writing(dir.path(), feed).unwrap();
        writer.put(1, &Signature([1; 16])).unwrap();

        let first = ProdIndexMap::open_for_reading(dir.path(), feed).unwrap();
        match ProdIndexMap::open_for_reading(dir.path(), feed) {
            Err(PimError::Busy(f)) => assert_eq!(f, feed),
            other => panic!("expected Busy, got {:?}", other.is_ok()),
        }

        first.close();
        assert!(ProdIndexMap::open_for_reading(dir.path(), feed).is_ok());
    }

    #[test]
    fn missing_map_file_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(
            ProdIndexMap::open_for_reading(dir.path(), Feed(0x2)).is_err()
        );
    }
}
