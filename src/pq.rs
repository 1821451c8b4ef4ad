// Copyright 2021 Stratus Data Systems, Inc.

//! Read-cursor access to the on-disk product store: an append-only log of
//! products in insertion order. The session engine opens the store
//! read-only and walks it with a feed filter; the write half is used by the
//! ingest and multicast-sender siblings and by the test suite.
//!
//! Readers tolerate a concurrent appender: the end of the log is re-checked
//! on every scan and a partially-written trailing record reads as
//! end-of-queue.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};
use chrono::{DateTime, Utc};

use crate::error::PqError;
use crate::types::{Product, ProductClass, ProductInfo, Signature};

const MAGIC: &[u8; 4] = b"UPQ1";
const HEADER_SZ: u64 = 4;
const RECORD_HEADER_SZ: u64 = 8;

/// How a queue is opened. The engine always uses `ReadOnly`; `ReadWrite` is
/// for the processes that feed the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// An open product queue with a scan cursor. The cursor is a byte offset
/// into the log; scans advance it in insertion order.
pub struct ProductQueue {
    file: File,
    path: PathBuf,
    mode: OpenMode,
    cursor: u64,
}

impl ProductQueue {
    /// Creates an empty queue file, truncating any existing one, and opens
    /// it for writing.
    pub fn create(path: &Path) -> Result<ProductQueue, PqError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(MAGIC)?;
        file.flush()?;

        Ok(ProductQueue {
            file,
            path: path.to_path_buf(),
            mode: OpenMode::ReadWrite,
            cursor: HEADER_SZ,
        })
    }

    /// Opens an existing queue. The cursor starts at the oldest product.
    pub fn open(path: &Path, mode: OpenMode) -> Result<ProductQueue, PqError> {
        let mut options = OpenOptions::new();
        options.read(true);
        if let OpenMode::ReadWrite = mode {
            options.write(true);
        }
        let mut file = options.open(path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic).map_err(|_| {
            PqError::Corrupt(format!("{}: truncated header", path.display()))
        })?;
        if &magic != MAGIC {
            return Err(PqError::Corrupt(format!(
                "{}: bad magic {:?}",
                path.display(),
                magic
            )));
        }

        Ok(ProductQueue {
            file,
            path: path.to_path_buf(),
            mode,
            cursor: HEADER_SZ,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a product to the log.
    pub fn insert(&mut self, product: &Product) -> Result<(), PqError> {
        if self.mode != OpenMode::ReadWrite {
            return Err(PqError::ReadOnly);
        }

        let info_buf = serde_json::to_vec(&product.info)
            .map_err(|e| PqError::Corrupt(e.to_string()))?;
        let mut header = [0u8; RECORD_HEADER_SZ as usize];
        BigEndian::write_u32(&mut header[0..4], info_buf.len() as u32);
        BigEndian::write_u32(&mut header[4..8], product.data.len() as u32);

        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&header)?;
        self.file.write_all(&info_buf)?;
        self.file.write_all(&product.data)?;
        self.file.flush()?;

        Ok(())
    }

    /// Reads the record starting at `offset`. Returns `None` at (or past)
    /// the current end of the log, including when the trailing record is
    /// still being appended by a concurrent writer.
    fn read_record_at(
        &mut self,
        offset: u64,
    ) -> Result<Option<(ProductInfo, Vec<u8>, u64)>, PqError> {
        let len = self.file.metadata()?.len();
        if offset + RECORD_HEADER_SZ > len {
            return Ok(None);
        }

        let mut header = [0u8; RECORD_HEADER_SZ as usize];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut header)?;
        let info_len = u64::from(BigEndian::read_u32(&header[0..4]));
        let data_len = u64::from(BigEndian::read_u32(&header[4..8]));

        let next = offset + RECORD_HEADER_SZ + info_len + data_len;
        if next > len {
            // Trailing record not yet complete
            return Ok(None);
        }

        let mut info_buf = vec![0u8; info_len as usize];
        self.file.read_exact(&mut info_buf)?;
        let info: ProductInfo =
            serde_json::from_slice(&info_buf).map_err(|e| {
                PqError::Corrupt(format!(
                    "{}: record at {}: {}",
                    self.path.display(),
                    offset,
                    e
                ))
            })?;

        let mut data = vec![0u8; data_len as usize];
        self.file.read_exact(&mut data)?;

        Ok(Some((info, data, next)))
    }

    /// Positions the cursor so that a forward scan yields the products
    /// inserted strictly after the one with the given signature.
    pub fn set_cursor_from_signature(
        &mut self,
        sig: &Signature,
    ) -> Result<(), PqError> {
        let mut offset = HEADER_SZ;
        while let Some((info, _data, next)) = self.read_record_at(offset)? {
            if info.signature == *sig {
                self.cursor = next;
                return Ok(());
            }
            offset = next;
        }
        Err(PqError::NotFound)
    }

    /// Positions the cursor at the oldest product whose arrival time is at
    /// or after `ts`. With no such product the cursor sits at end-of-queue.
    pub fn set_cursor_from_time(
        &mut self,
        ts: DateTime<Utc>,
    ) -> Result<(), PqError> {
        let mut offset = HEADER_SZ;
        while let Some((info, _data, next)) = self.read_record_at(offset)? {
            if info.arrival >= ts {
                self.cursor = offset;
                return Ok(());
            }
            offset = next;
        }
        self.cursor = offset;
        Ok(())
    }

    /// Advances the cursor to the next product matching `class` and invokes
    /// `f` on it. Returns `Ok(None)` when the scan reaches end-of-queue
    /// without a match.
    pub fn sequence<F, T>(
        &mut self,
        class: &ProductClass,
        f: F,
    ) -> Result<Option<T>, PqError>
    where
        F: FnOnce(&ProductInfo, &[u8]) -> T,
    {
        let mut offset = self.cursor;
        while let Some((info, data, next)) = self.read_record_at(offset)? {
            offset = next;
            if class.matches(&info) {
                self.cursor = offset;
                return Ok(Some(f(&info, &data)));
            }
        }
        self.cursor = offset;
        Ok(None)
    }

    /// Locates the product with the given signature, independent of the
    /// cursor, and invokes `f` on it. `PqError::NotFound` when the
    /// retention window has dropped it.
    pub fn process_product<F, T>(
        &mut self,
        sig: &Signature,
        f: F,
    ) -> Result<T, PqError>
    where
        F: FnOnce(&ProductInfo, &[u8]) -> T,
    {
        let mut offset = HEADER_SZ;
        while let Some((info, data, next)) = self.read_record_at(offset)? {
            if info.signature == *sig {
                return Ok(f(&info, &data));
            }
            offset = next;
        }
        Err(PqError::NotFound)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use chrono::Duration;
    use tempfile::tempdir;

    use crate::types::Feed;

    fn product(sig_byte: u8, feed: Feed, secs_ago: i64) -> Product {
        let data = vec![sig_byte; 32];
        Product {
            info: ProductInfo {
                arrival: Utc::now() - Duration::seconds(secs_ago),
                signature: Signature([sig_byte; 16]),
                origin: String::from("test.origin"),
                feed,
                seq_num: u32::from(sig_byte),
                ident: format!("product-{:02x}", sig_byte),
                size: data.len() as u32,
            },
            data,
        }
    }

    fn seeded_queue(dir: &Path, products: &[Product]) -> PathBuf {
        let path = dir.join("products.pq");
        let mut pq = ProductQueue::create(&path).unwrap();
        for p in products {
            pq.insert(p).unwrap();
        }
        path
    }

    #[test]
    fn insert_requires_write_mode() {
        let dir = tempdir().unwrap();
        let path = seeded_queue(dir.path(), &[]);
        let mut pq = ProductQueue::open(&path, OpenMode::ReadOnly).unwrap();
        match pq.insert(&product(1, Feed(0x1), 0)) {
            Err(PqError::ReadOnly) => (),
            other => panic!("expected ReadOnly, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn open_rejects_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("junk.pq");
        std::fs::write(&path, b"nope").unwrap();
        assert!(ProductQueue::open(&path, OpenMode::ReadOnly).is_err());
    }

    #[test]
    fn sequence_walks_in_insertion_order() {
        let dir = tempdir().unwrap();
        let products = [
            product(1, Feed(0x1), 30),
            product(2, Feed(0x2), 20),
            product(3, Feed(0x1), 10),
        ];
        let path = seeded_queue(dir.path(), &products);
        let mut pq = ProductQueue::open(&path, OpenMode::ReadOnly).unwrap();

        let class = ProductClass::all();
        let mut seen = Vec::new();
        while let Some(sig) =
            pq.sequence(&class, |info, _| info.signature).unwrap()
        {
            seen.push(sig);
        }
        assert_eq!(
            seen,
            vec![Signature([1; 16]), Signature([2; 16]), Signature([3; 16])]
        );
    }

    #[test]
    fn sequence_honors_feed_filter() {
        let dir = tempdir().unwrap();
        let products = [
            product(1, Feed(0x1), 30),
            product(2, Feed(0x2), 20),
            product(3, Feed(0x1), 10),
        ];
        let path = seeded_queue(dir.path(), &products);
        let mut pq = ProductQueue::open(&path, OpenMode::ReadOnly).unwrap();

        let class = ProductClass::all().narrow_feed(Feed(0x2));
        let first = pq.sequence(&class, |info, _| info.signature).unwrap();
        assert_eq!(first, Some(Signature([2; 16])));
        let rest = pq.sequence(&class, |info, _| info.signature).unwrap();
        assert_eq!(rest, None);
    }

    #[test]
    fn cursor_from_signature_yields_strictly_later_products() {
        let dir = tempdir().unwrap();
        let products = [
            product(1, Feed(0x1), 30),
            product(2, Feed(0x1), 20),
            product(3, Feed(0x1), 10),
        ];
        let path = seeded_queue(dir.path(), &products);
        let mut pq = ProductQueue::open(&path, OpenMode::ReadOnly).unwrap();

        pq.set_cursor_from_signature(&Signature([1; 16])).unwrap();
        let class = ProductClass::all();
        let next = pq.sequence(&class, |info, _| info.signature).unwrap();
        assert_eq!(next, Some(Signature([2; 16])));
    }

    #[test]
    fn cursor_from_unknown_signature_is_not_found() {
        let dir = tempdir().unwrap();
        let path = seeded_queue(dir.path(), &[product(1, Feed(0x1), 30)]);
        let mut pq = ProductQueue::open(&path, OpenMode::ReadOnly).unwrap();
        match pq.set_cursor_from_signature(&Signature([9; 16])) {
            Err(PqError::NotFound) => (),
            other => panic!("expected NotFound, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn cursor_from_time_skips_older_products() {
        let dir = tempdir().unwrap();
        let products = [
            product(1, Feed(0x1), 3000),
            product(2, Feed(0x1), 2000),
            product(3, Feed(0x1), 10),
        ];
        let path = seeded_queue(dir.path(), &products);
        let mut pq = ProductQueue::open(&path, OpenMode::ReadOnly).unwrap();

        pq.set_cursor_from_time(Utc::now() - Duration::seconds(1000))
            .unwrap();
        let class = ProductClass::all();
        let next = pq.sequence(&class, |info, _| info.signature).unwrap();
        assert_eq!(next, Some(Signature([3; 16])));
    }

    #[test]
    fn process_product_finds_by_signature() {
        let dir = tempdir().unwrap();
        let products = [
            product(1, Feed(0x1), 30),
            product(2, Feed(0x1), 20),
        ];
        let path = seeded_queue(dir.path(), &products);
        let mut pq = ProductQueue::open(&path, OpenMode::ReadOnly).unwrap();

        let data =
            pq.process_product(&Signature([2; 16]), |_, data| data.to_vec());
        assert_eq!(data.unwrap(), vec![2u8; 32]);

        match pq.process_product(&Signature([9; 16]), |_, _| ()) {
            Err(PqError::NotFound) => (),
            other => panic!("expected NotFound, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn reader_sees_products_appended_after_open() {
        let dir = tempdir().unwrap();
        let path = seeded_queue(dir.path(), &[product(1, Feed(0x1), 30)]);
        let mut reader =
            ProductQueue::open(&path, OpenMode::ReadOnly).unwrap();
        let mut writer =
            ProductQueue::open(&path, OpenMode::ReadWrite).unwrap();

        let class = ProductClass::all();
        assert!(reader.sequence(&class, |_, _| ()).unwrap().is_some());
        assert!(reader.sequence(&class, |_, _| ()).unwrap().is_none());

        writer.insert(&product(2, Feed(0x1), 0)).unwrap();
        let appended = reader.sequence(&class, |info, _| info.signature);
        assert_eq!(appended.unwrap(), Some(Signature([2; 16])));
    }
}
