//! Single-file record database: fixed 32-byte header, an append-only
//! record area, and a trailing index block written by `flush`.
//!
//! ```text
//! [0..32)             header
//! [32..data_offset)   records: 16-byte UUID || 4-byte BE size || payload
//! [data_offset..EOF)  index block (if index_offset > 0): 32-byte entries
//!                     of (UUID, 8-byte BE offset, 4-byte BE size, 4-byte BE CRC-32)
//! ```
//!
//! Durability is explicitly best-effort: a mutation is durable only after
//! `flush()`. Callers that need crash-safety (the metadata collections)
//! flush after every logical change.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::btree::BTree;
use crate::checksum::crc32;
use crate::codec::{self, CodecError, Value};

const MAGIC: &[u8; 4] = b"DOWE";
const HEADER_LEN: u64 = 32;
const MAJOR_VERSION: u8 = 1;
const MINOR_VERSION: u8 = 0;
const RECORD_PREFIX_LEN: u64 = 20; // 16-byte id + 4-byte size
const INDEX_ENTRY_LEN: u64 = 32; // 16 + 8 + 4 + 4

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid header: {0}")]
    InvalidHeader(String),
    #[error("record payload failed CRC-32 verification")]
    Corruption,
    #[error("record {0} not found")]
    NotFound(Uuid),
    #[error("encoding error: {0}")]
    Codec(#[from] CodecError),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone, Copy)]
struct RecordLocation {
    /// Offset of the record's 16-byte id, not the payload.
    offset: u64,
    size: u32,
    crc: u32,
}

pub struct Store {
    path: PathBuf,
    file: File,
    index: BTree<RecordLocation>,
    data_offset: u64,
    index_offset: u64,
}

impl Store {
    /// Opens the store at `path`, creating it (with an empty header) if it
    /// doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let existed = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        if !existed || file.metadata()?.len() == 0 {
            let mut store = Store {
                path,
                file,
                index: BTree::default(),
                data_offset: HEADER_LEN,
                index_offset: 0,
            };
            store.write_header(0)?;
            return Ok(store);
        }

        let mut header = [0u8; HEADER_LEN as usize];
        file.read_exact_at(&mut header, 0)?;
        if &header[0..4] != MAGIC {
            return Err(StorageError::InvalidHeader(
                "bad magic: not a dowe record file".into(),
            ));
        }
        let index_offset = u64::from_be_bytes(header[8..16].try_into().unwrap());
        let data_offset = u64::from_be_bytes(header[16..24].try_into().unwrap());

        let mut index = BTree::default();
        if index_offset > 0 {
            let file_len = file.metadata()?.len();
            let mut pos = index_offset;
            while pos + INDEX_ENTRY_LEN <= file_len {
                let mut buf = [0u8; INDEX_ENTRY_LEN as usize];
                file.read_exact_at(&mut buf, pos)?;
                let id = Uuid::from_bytes(buf[0..16].try_into().unwrap());
                let offset = u64::from_be_bytes(buf[16..24].try_into().unwrap());
                let size = u32::from_be_bytes(buf[24..28].try_into().unwrap());
                let crc = u32::from_be_bytes(buf[28..32].try_into().unwrap());
                index.set(id, RecordLocation { offset, size, crc });
                pos += INDEX_ENTRY_LEN;
            }
        }

        Ok(Store {
            path,
            file,
            index,
            data_offset,
            index_offset,
        })
    }

    fn write_header(&mut self, record_count: u64) -> StorageResult<()> {
        let mut header = [0u8; HEADER_LEN as usize];
        header[0..4].copy_from_slice(MAGIC);
        header[4] = MAJOR_VERSION;
        header[5] = MINOR_VERSION;
        header[6..8].copy_from_slice(&0u16.to_be_bytes()); // flags, unused
        header[8..16].copy_from_slice(&self.index_offset.to_be_bytes());
        header[16..24].copy_from_slice(&self.data_offset.to_be_bytes());
        header[24..32].copy_from_slice(&record_count.to_be_bytes());
        self.file.write_all_at(&header, 0)?;
        Ok(())
    }

    /// Encodes `value`, appends it, and indexes its location. Returns the
    /// new record's id (canonical hyphenated form), its offset, and its
    /// encoded size.
    pub fn write(&mut self, value: &Value) -> StorageResult<(String, u64, u32)> {
        let payload = codec::encode(value);
        let crc = crc32(&payload);
        let id = Uuid::new_v4();
        let record_offset = self.data_offset;
        let size = payload.len() as u32;

        let mut record = Vec::with_capacity(RECORD_PREFIX_LEN as usize + payload.len());
        record.extend_from_slice(id.as_bytes());
        record.extend_from_slice(&size.to_be_bytes());
        record.extend_from_slice(&payload);
        self.file.write_all_at(&record, record_offset)?;

        self.data_offset = record_offset + record.len() as u64;
        self.index.set(id, RecordLocation {
            offset: record_offset,
            size,
            crc,
        });

        Ok((id.to_string(), record_offset, size))
    }

    pub fn read(&self, id: &Uuid) -> StorageResult<Value> {
        let location = *self.index.get(id).ok_or(StorageError::NotFound(*id))?;
        let mut payload = vec![0u8; location.size as usize];
        self.file
            .read_exact_at(&mut payload, location.offset + RECORD_PREFIX_LEN)?;
        if crc32(&payload) != location.crc {
            return Err(StorageError::Corruption);
        }
        Ok(codec::decode(&payload)?)
    }

    /// Removes `id` from the index. The payload bytes are left in place
    /// until the next `compact()`.
    pub fn delete(&mut self, id: &Uuid) -> StorageResult<()> {
        self.index
            .delete(id)
            .map(|_| ())
            .ok_or(StorageError::NotFound(*id))
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.index.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.index.size()
    }

    pub fn is_empty(&self) -> bool {
        self.index.size() == 0
    }

    /// All live ids, in ascending order.
    pub fn ids(&self) -> Vec<Uuid> {
        self.index.entries().into_iter().map(|(id, _)| id).collect()
    }

    /// Writes the index block at the current data offset and rewrites the
    /// header so `index_offset` and `record_count` reflect it.
    pub fn flush(&mut self) -> StorageResult<()> {
        let entries = self.index.entries();
        let index_offset = self.data_offset;
        let mut block = Vec::with_capacity(entries.len() * INDEX_ENTRY_LEN as usize);
        for (id, location) in &entries {
            block.extend_from_slice(id.as_bytes());
            block.extend_from_slice(&location.offset.to_be_bytes());
            block.extend_from_slice(&location.size.to_be_bytes());
            block.extend_from_slice(&location.crc.to_be_bytes());
        }
        self.file.write_all_at(&block, index_offset)?;
        self.file.set_len(index_offset + block.len() as u64)?;
        self.index_offset = index_offset;
        self.write_header(entries.len() as u64)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Rewrites the file keeping only live records, discarding dead bytes
    /// left behind by earlier deletes. Compaction is not identity-preserving
    /// on ids: every surviving record is re-written with a freshly minted
    /// id. Higher layers must reference records by their own `id` field,
    /// never by the storage-assigned id, for this to be safe (see
    /// DESIGN.md).
    pub fn compact(&mut self) -> StorageResult<()> {
        let tmp_path = {
            let mut p = self.path.clone().into_os_string();
            p.push(".tmp");
            PathBuf::from(p)
        };
        {
            let mut tmp = Store::open(&tmp_path)?;
            for (id, _) in self.index.entries() {
                let value = self.read(&id)?;
                tmp.write(&value)?;
            }
            tmp.flush()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        let reopened = Store::open(&self.path)?;
        *self = reopened;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ObjectBuilder;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn sample(n: i64) -> Value {
        ObjectBuilder::new()
            .field("n", Value::Int(n))
            .field("name", Value::Str(format!("item-{n}")))
            .build()
    }

    #[test]
    fn write_read_roundtrip_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let mut ids = Vec::new();
        {
            let mut store = Store::open(&path).unwrap();
            for n in 0..10 {
                let (id, _, _) = store.write(&sample(n)).unwrap();
                ids.push(id);
            }
            store.flush().unwrap();
        }

        let store = Store::open(&path).unwrap();
        assert_eq!(store.len(), 10);
        for (n, id) in ids.iter().enumerate() {
            let uuid = Uuid::parse_str(id).unwrap();
            assert_eq!(store.read(&uuid).unwrap(), sample(n as i64));
        }
    }

    #[test]
    fn delete_then_flush_then_reopen_drops_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let mut store = Store::open(&path).unwrap();
        let (id, _, _) = store.write(&sample(1)).unwrap();
        let uuid = Uuid::parse_str(&id).unwrap();
        store.flush().unwrap();
        store.delete(&uuid).unwrap();
        store.flush().unwrap();
        drop(store);

        let store = Store::open(&path).unwrap();
        assert!(!store.contains(&uuid));
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn unflushed_writes_are_not_durable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let mut store = Store::open(&path).unwrap();
        store.write(&sample(1)).unwrap();
        drop(store); // no flush

        let store = Store::open(&path).unwrap();
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn corrupted_payload_fails_crc_check() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let mut store = Store::open(&path).unwrap();
        let (id, offset, _) = store.write(&sample(7)).unwrap();
        store.flush().unwrap();
        let uuid = Uuid::parse_str(&id).unwrap();
        drop(store);

        // Flip one payload byte in place.
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        let mut byte = [0u8; 1];
        file.read_exact_at(&mut byte, offset + RECORD_PREFIX_LEN).unwrap();
        byte[0] ^= 0xFF;
        file.write_all_at(&byte, offset + RECORD_PREFIX_LEN).unwrap();
        drop(file);

        let store = Store::open(&path).unwrap();
        let err = store.read(&uuid).unwrap_err();
        assert!(matches!(err, StorageError::Corruption));
    }

    #[test]
    fn compact_preserves_live_values_but_mints_new_ids() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");

        let mut store = Store::open(&path).unwrap();
        let (id_a, _, _) = store.write(&sample(1)).unwrap();
        let (id_b, _, _) = store.write(&sample(2)).unwrap();
        store.flush().unwrap();
        store.delete(&Uuid::parse_str(&id_a).unwrap()).unwrap();
        store.flush().unwrap();

        store.compact().unwrap();

        assert_eq!(store.len(), 1);
        let surviving_ids = store.ids();
        assert_eq!(surviving_ids.len(), 1);
        assert_ne!(surviving_ids[0].to_string(), id_b);
        assert_eq!(store.read(&surviving_ids[0]).unwrap(), sample(2));
    }

    #[test]
    fn read_missing_id_is_not_found() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = Store::open(&path).unwrap();
        let err = store.read(&Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }
}
