use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{NodeError, NodeResult};

/// View into a buffer store. `(0, 0)` is the null view.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferView {
    pub offset: i64,
    pub size: u32,
}

impl BufferView {
    pub fn is_null(&self) -> bool {
        self.offset == 0 && self.size == 0
    }
}

/// Append-only byte arena backed by a single file. Raw ledger shards use
/// one store per shard to hold input/output payloads referenced by
/// `(offset, size)` views from the SQLite rows.
pub struct BufferStore {
    file: File,
    next_write_pos: i64,
}

impl BufferStore {
    pub fn open(path: &Path) -> NodeResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let next_write_pos = file.metadata()?.len() as i64;
        Ok(Self {
            file,
            next_write_pos,
        })
    }

    /// Appends `buf` and returns the view addressing it.
    pub fn write_buf(&mut self, buf: &[u8]) -> NodeResult<BufferView> {
        let view = BufferView {
            offset: self.next_write_pos,
            size: buf.len() as u32,
        };
        self.file.write_all_at(buf, view.offset as u64)?;
        self.next_write_pos += buf.len() as i64;
        Ok(view)
    }

    pub fn read_buf(&self, view: &BufferView) -> NodeResult<Vec<u8>> {
        if view.is_null() {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; view.size as usize];
        self.file.read_exact_at(&mut buf, view.offset as u64)?;
        Ok(buf)
    }

    /// Releases the underlying storage of a view by punching a hole. The
    /// view's offsets stay valid but read back as zeroes.
    pub fn purge(&mut self, view: &BufferView) -> NodeResult<()> {
        if view.is_null() {
            return Ok(());
        }
        let ret = unsafe {
            libc::fallocate(
                self.file.as_raw_fd(),
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                view.offset,
                view.size as i64,
            )
        };
        if ret != 0 {
            return Err(NodeError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().expect("tempdir");
        let mut store = BufferStore::open(&dir.path().join("blobs")).expect("open store");
        let first = store.write_buf(b"first payload").expect("write");
        let second = store.write_buf(b"second").expect("write");
        assert_eq!(first.offset, 0);
        assert_eq!(second.offset, first.size as i64);
        assert_eq!(store.read_buf(&first).expect("read"), b"first payload");
        assert_eq!(store.read_buf(&second).expect("read"), b"second");
    }

    #[test]
    fn null_view_reads_empty() {
        let dir = tempdir().expect("tempdir");
        let store = BufferStore::open(&dir.path().join("blobs")).expect("open store");
        assert!(BufferView::default().is_null());
        assert!(store.read_buf(&BufferView::default()).expect("read").is_empty());
    }

    #[test]
    fn reopen_appends_after_existing_content() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("blobs");
        {
            let mut store = BufferStore::open(&path).expect("open store");
            store.write_buf(b"persisted").expect("write");
        }
        let mut store = BufferStore::open(&path).expect("reopen store");
        let view = store.write_buf(b"more").expect("write");
        assert_eq!(view.offset, "persisted".len() as i64);
    }

    #[test]
    fn purged_view_reads_zeroes() {
        let dir = tempdir().expect("tempdir");
        let mut store = BufferStore::open(&dir.path().join("blobs")).expect("open store");
        let view = store.write_buf(&[7u8; 64]).expect("write");
        store.purge(&view).expect("purge");
        assert_eq!(store.read_buf(&view).expect("read"), vec![0u8; 64]);
    }
}
