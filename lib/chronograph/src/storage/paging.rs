//! The paged file substrate: fixed-size pages of a memory-mapped file.
//!
//! Page 0 of every paged file is a header carrying the file magic, format
//! version, the root page id of the structure stored in the file, the free
//! list head, the bump allocation counter, the durable transaction id and a
//! checksum. Nothing written through the map is considered durable until
//! [`PagedFile::checkpoint`] has flushed it.

use crate::storage::error::{CorruptionError, StorageError};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::{Mutex, RwLock};

pub const PAGE_SIZE: usize = 4096;

pub type PageId = u64;

/// Page id 0 is the header page, so it doubles as the null page.
pub const NO_PAGE: PageId = 0;

pub const FORMAT_VERSION: u32 = 1;

const HEADER_LEN: usize = 52;

/// Initial file size: the header page plus room for a small tree.
const INITIAL_PAGES: u64 = 16;

/// A fixed-size-page file memory-mapped read/write.
pub struct PagedFile {
    file: File,
    map: RwLock<MmapMut>,
    state: Mutex<HeaderState>,
    magic: u64,
    name: String,
}

/// The in-memory copy of the header page, persisted on checkpoint.
#[derive(Debug, Clone, Copy)]
pub struct HeaderState {
    pub root_page: PageId,
    pub free_head: PageId,
    pub next_page: PageId,
    pub durable_tx: u64,
}

impl PagedFile {
    /// Opens the file, creating and formatting it if it does not exist.
    #[allow(unsafe_code)]
    pub fn open(path: &Path, magic: u64) -> Result<Self, StorageError> {
        let name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let is_new = file.metadata()?.len() == 0;
        if is_new {
            file.set_len(INITIAL_PAGES * PAGE_SIZE as u64)?;
        }
        // SAFETY: the store holds an exclusive OS lock on its directory, so
        // no other process mutates the file underneath the map.
        let map = unsafe { MmapMut::map_mut(&file)? };
        let this = Self {
            file,
            map: RwLock::new(map),
            state: Mutex::new(HeaderState {
                root_page: NO_PAGE,
                free_head: NO_PAGE,
                next_page: 1,
                durable_tx: 0,
            }),
            magic,
            name,
        };
        if is_new {
            this.write_header()?;
            this.flush()?;
        } else {
            let state = this.read_header()?;
            *this.state.lock().unwrap() = state;
        }
        Ok(this)
    }

    fn read_header(&self) -> Result<HeaderState, StorageError> {
        let map = self.map.read().unwrap();
        if map.len() < PAGE_SIZE {
            return Err(CorruptionError::BadHeader {
                file: self.name.clone(),
                reason: "file shorter than the header page".into(),
            }
            .into());
        }
        let header = &map[..HEADER_LEN];
        let magic = u64::from_be_bytes(header[0..8].try_into().unwrap());
        if magic != self.magic {
            return Err(CorruptionError::BadHeader {
                file: self.name.clone(),
                reason: format!("magic number {magic:#x} does not match {:#x}", self.magic),
            }
            .into());
        }
        let version = u32::from_be_bytes(header[8..12].try_into().unwrap());
        if version > FORMAT_VERSION {
            return Err(CorruptionError::BadHeader {
                file: self.name.clone(),
                reason: format!("format version {version} is newer than the supported {FORMAT_VERSION}"),
            }
            .into());
        }
        let expected_crc = u32::from_be_bytes(header[48..52].try_into().unwrap());
        if crc32fast::hash(&header[..48]) != expected_crc {
            return Err(CorruptionError::BadHeader {
                file: self.name.clone(),
                reason: "header checksum mismatch".into(),
            }
            .into());
        }
        Ok(HeaderState {
            root_page: u64::from_be_bytes(header[16..24].try_into().unwrap()),
            free_head: u64::from_be_bytes(header[24..32].try_into().unwrap()),
            next_page: u64::from_be_bytes(header[32..40].try_into().unwrap()),
            durable_tx: u64::from_be_bytes(header[40..48].try_into().unwrap()),
        })
    }

    /// Serializes the in-memory header state into page 0.
    pub fn write_header(&self) -> Result<(), StorageError> {
        let state = *self.state.lock().unwrap();
        let mut header = [0_u8; HEADER_LEN];
        header[0..8].copy_from_slice(&self.magic.to_be_bytes());
        header[8..12].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
        header[16..24].copy_from_slice(&state.root_page.to_be_bytes());
        header[24..32].copy_from_slice(&state.free_head.to_be_bytes());
        header[32..40].copy_from_slice(&state.next_page.to_be_bytes());
        header[40..48].copy_from_slice(&state.durable_tx.to_be_bytes());
        let crc = crc32fast::hash(&header[..48]);
        header[48..52].copy_from_slice(&crc.to_be_bytes());
        let mut map = self.map.write().unwrap();
        map[..HEADER_LEN].copy_from_slice(&header);
        Ok(())
    }

    pub fn header_state(&self) -> HeaderState {
        *self.state.lock().unwrap()
    }

    pub fn set_root_page(&self, root: PageId) {
        self.state.lock().unwrap().root_page = root;
    }

    pub fn set_durable_tx(&self, tx: u64) {
        self.state.lock().unwrap().durable_tx = tx;
    }

    /// Allocates a page: pops the free list, else bumps the counter.
    pub fn allocate(&self) -> Result<PageId, StorageError> {
        let mut state = self.state.lock().unwrap();
        if state.free_head != NO_PAGE {
            let id = state.free_head;
            let page = self.read_page_internal(id)?;
            state.free_head = u64::from_be_bytes(page[0..8].try_into().unwrap());
            Ok(id)
        } else {
            let id = state.next_page;
            state.next_page += 1;
            self.ensure_capacity(state.next_page)?;
            Ok(id)
        }
    }

    /// Pushes a page onto the free list. The caller must guarantee that no
    /// live snapshot can still reference it.
    pub fn free_page(&self, id: PageId) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        let mut page = [0_u8; PAGE_SIZE];
        page[0..8].copy_from_slice(&state.free_head.to_be_bytes());
        self.write_page_internal(id, &page)?;
        state.free_head = id;
        Ok(())
    }

    pub fn read_page(&self, id: PageId) -> Result<[u8; PAGE_SIZE], StorageError> {
        if id == NO_PAGE {
            return Err(CorruptionError::msg(format!(
                "attempt to read the null page of {}",
                self.name
            ))
            .into());
        }
        self.read_page_internal(id)
    }

    fn read_page_internal(&self, id: PageId) -> Result<[u8; PAGE_SIZE], StorageError> {
        let map = self.map.read().unwrap();
        let start = usize::try_from(id).unwrap() * PAGE_SIZE;
        let Some(bytes) = map.get(start..start + PAGE_SIZE) else {
            return Err(CorruptionError::msg(format!(
                "page {id} is beyond the end of {}",
                self.name
            ))
            .into());
        };
        let mut page = [0_u8; PAGE_SIZE];
        page.copy_from_slice(bytes);
        Ok(page)
    }

    pub fn write_page(&self, id: PageId, data: &[u8; PAGE_SIZE]) -> Result<(), StorageError> {
        if id == NO_PAGE {
            return Err(CorruptionError::msg(format!(
                "attempt to overwrite the header page of {}",
                self.name
            ))
            .into());
        }
        self.write_page_internal(id, data)
    }

    fn write_page_internal(&self, id: PageId, data: &[u8; PAGE_SIZE]) -> Result<(), StorageError> {
        let mut map = self.map.write().unwrap();
        let start = usize::try_from(id).unwrap() * PAGE_SIZE;
        let Some(bytes) = map.get_mut(start..start + PAGE_SIZE) else {
            return Err(CorruptionError::msg(format!(
                "page {id} is beyond the end of {}",
                self.name
            ))
            .into());
        };
        bytes.copy_from_slice(data);
        Ok(())
    }

    /// Grows the backing file and remaps if `page_count` pages do not fit.
    #[allow(unsafe_code)]
    fn ensure_capacity(&self, page_count: u64) -> Result<(), StorageError> {
        let needed = page_count * PAGE_SIZE as u64;
        let mut map = self.map.write().unwrap();
        if (map.len() as u64) < needed {
            let new_len = needed.max(map.len() as u64 * 2);
            map.flush()?;
            self.file.set_len(new_len)?;
            // SAFETY: same exclusivity argument as in `open`.
            *map = unsafe { MmapMut::map_mut(&self.file)? };
        }
        Ok(())
    }

    /// Flushes all dirty pages and the header to disk, in that order, so a
    /// persisted header never points into unflushed data.
    pub fn checkpoint(&self) -> Result<(), StorageError> {
        self.flush()?;
        self.write_header()?;
        let map = self.map.read().unwrap();
        map.flush_range(0, PAGE_SIZE)?;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.map.read().unwrap().flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_round_trip() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let file = PagedFile::open(&dir.path().join("t.idx"), 0x1234_5678_9abc_def0)?;
        let id = file.allocate()?;
        let mut page = [0_u8; PAGE_SIZE];
        page[0] = 0xab;
        page[PAGE_SIZE - 1] = 0xcd;
        file.write_page(id, &page)?;
        assert_eq!(file.read_page(id)?, page);
        Ok(())
    }

    #[test]
    fn free_list_reuses_pages() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let file = PagedFile::open(&dir.path().join("t.idx"), 1)?;
        let a = file.allocate()?;
        let b = file.allocate()?;
        file.free_page(a)?;
        assert_eq!(file.allocate()?, a);
        let c = file.allocate()?;
        assert_ne!(c, a);
        assert_ne!(c, b);
        Ok(())
    }

    #[test]
    fn header_survives_reopen() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("t.idx");
        {
            let file = PagedFile::open(&path, 7)?;
            let root = file.allocate()?;
            file.write_page(root, &[0_u8; PAGE_SIZE])?;
            file.set_root_page(root);
            file.checkpoint()?;
        }
        let file = PagedFile::open(&path, 7)?;
        assert_ne!(file.header_state().root_page, NO_PAGE);
        Ok(())
    }

    #[test]
    fn wrong_magic_is_refused() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("t.idx");
        drop(PagedFile::open(&path, 7)?);
        assert!(matches!(
            PagedFile::open(&path, 8),
            Err(StorageError::Corruption(_))
        ));
        Ok(())
    }

    #[test]
    fn grows_past_initial_capacity() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let file = PagedFile::open(&dir.path().join("t.idx"), 9)?;
        let mut last = 0;
        for _ in 0..100 {
            last = file.allocate()?;
        }
        file.write_page(last, &[1_u8; PAGE_SIZE])?;
        assert_eq!(file.read_page(last)?[17], 1);
        Ok(())
    }
}
