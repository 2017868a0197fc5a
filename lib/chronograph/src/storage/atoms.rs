//! The atom dictionary: RDF terms interned into fixed-width ids.
//!
//! `atoms.bin` holds an append-only blob of canonical term encodings plus
//! the id → offset table (grown by appending doubled extents). `atoms.hash`
//! holds an open-addressing hash index from 64-bit FNV-1a content hashes to
//! atom words. Atoms are never freed within a store's lifetime; pruning
//! rebuilds a fresh dictionary instead.

use crate::storage::error::{CorruptionError, StorageError};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::RwLock;

/// Atoms larger than this are refused.
pub const MAX_ATOM_LEN: usize = 64 * 1024;

/// The number of counters in the 40-bit id space.
const MAX_COUNTER: u64 = 1 << 40;

const BIN_MAGIC: u64 = 0x6368_726f_6e6f_4131; // "chronoA1"
const HASH_MAGIC: u64 = 0x6368_726f_6e6f_4831; // "chronoH1"
const FORMAT_VERSION: u32 = 1;

const HEADER_RESERVED: u64 = 4096;
const BIN_HEADER_LEN: usize = 56;
const HASH_HEADER_LEN: usize = 48;

const INITIAL_TABLE_CAP: u64 = 1024;
const INITIAL_BUCKET_CAP: u64 = 4096;

const FLAG_DATATYPE: u8 = 1;
const FLAG_LANG: u8 = 2;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// The kind of an interned term, encoded in the two high bits of its id.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash)]
#[repr(u8)]
pub enum AtomKind {
    NamedNode = 0,
    BlankNode = 1,
    Literal = 2,
    /// A query-local placeholder that never reaches the indexes: constants
    /// of a query that are absent from the dictionary, and values computed
    /// by expression evaluation.
    Local = 3,
}

impl AtomKind {
    fn from_bits(bits: u64) -> Self {
        match bits & 0b11 {
            0 => Self::NamedNode,
            1 => Self::BlankNode,
            2 => Self::Literal,
            _ => Self::Local,
        }
    }
}

/// An interned term id: the kind in the two high bits, a 40-bit counter in
/// the low bits. Counter 0 is the default graph sentinel.
#[derive(Eq, PartialEq, Ord, PartialOrd, Debug, Clone, Copy, Hash)]
pub struct AtomId(u64);

impl AtomId {
    pub const DEFAULT_GRAPH: Self = Self(0);

    #[inline]
    pub fn new(kind: AtomKind, counter: u64) -> Self {
        debug_assert!(counter < MAX_COUNTER);
        Self((u64::from(kind as u8) << 62) | counter)
    }

    #[inline]
    pub fn from_word(word: u64) -> Self {
        Self(word)
    }

    #[inline]
    pub fn word(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn kind(self) -> AtomKind {
        AtomKind::from_bits(self.0 >> 62)
    }

    #[inline]
    pub fn counter(self) -> u64 {
        self.0 & (MAX_COUNTER - 1)
    }

    #[inline]
    pub fn is_default_graph(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn is_local(self) -> bool {
        self.kind() == AtomKind::Local
    }
}

/// A resolved atom, decoded from the blob region.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct AtomRecord {
    pub kind: AtomKind,
    pub value: Vec<u8>,
    pub datatype: Option<AtomId>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct AtomMeta {
    next_counter: u64,
    tail: u64,
    table_off: u64,
    table_cap: u64,
    bucket_off: u64,
    bucket_cap: u64,
    count: u64,
}

pub struct AtomStore {
    bin: RawMapped,
    hash: RawMapped,
    meta: RwLock<AtomMeta>,
}

impl AtomStore {
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        let (bin, bin_new) = RawMapped::open(&dir.join("atoms.bin"), HEADER_RESERVED * 4)?;
        let (hash, hash_new) = RawMapped::open(
            &dir.join("atoms.hash"),
            HEADER_RESERVED + INITIAL_BUCKET_CAP * 16,
        )?;
        if bin_new != hash_new {
            return Err(CorruptionError::CorruptAtomIndex(
                "atoms.bin and atoms.hash do not come from the same store".into(),
            )
            .into());
        }
        let meta = if bin_new {
            let meta = AtomMeta {
                next_counter: 1,
                tail: HEADER_RESERVED + INITIAL_TABLE_CAP * 8,
                table_off: HEADER_RESERVED,
                table_cap: INITIAL_TABLE_CAP,
                bucket_off: HEADER_RESERVED,
                bucket_cap: INITIAL_BUCKET_CAP,
                count: 0,
            };
            bin.ensure_len(meta.tail)?;
            let this = Self {
                bin,
                hash,
                meta: RwLock::new(meta),
            };
            this.write_headers()?;
            this.flush()?;
            return Ok(this);
        } else {
            Self::read_headers(&bin, &hash)?
        };
        Ok(Self {
            bin,
            hash,
            meta: RwLock::new(meta),
        })
    }

    fn read_headers(bin: &RawMapped, hash: &RawMapped) -> Result<AtomMeta, StorageError> {
        let header = bin.read(0, BIN_HEADER_LEN)?;
        check_magic(&header, BIN_MAGIC, "atoms.bin")?;
        if crc32fast::hash(&header[..BIN_HEADER_LEN - 4])
            != u32::from_be_bytes(header[BIN_HEADER_LEN - 4..].try_into().unwrap())
        {
            return Err(
                CorruptionError::CorruptAtomIndex("atoms.bin header checksum mismatch".into())
                    .into(),
            );
        }
        let next_counter = u64::from_be_bytes(header[16..24].try_into().unwrap());
        let tail = u64::from_be_bytes(header[24..32].try_into().unwrap());
        let table_off = u64::from_be_bytes(header[32..40].try_into().unwrap());
        let table_cap = u64::from_be_bytes(header[40..48].try_into().unwrap());

        let header = hash.read(0, HASH_HEADER_LEN)?;
        check_magic(&header, HASH_MAGIC, "atoms.hash")?;
        if crc32fast::hash(&header[..HASH_HEADER_LEN - 4])
            != u32::from_be_bytes(header[HASH_HEADER_LEN - 4..].try_into().unwrap())
        {
            return Err(
                CorruptionError::CorruptAtomIndex("atoms.hash header checksum mismatch".into())
                    .into(),
            );
        }
        let bucket_off = u64::from_be_bytes(header[16..24].try_into().unwrap());
        let bucket_cap = u64::from_be_bytes(header[24..32].try_into().unwrap());
        let count = u64::from_be_bytes(header[32..40].try_into().unwrap());
        Ok(AtomMeta {
            next_counter,
            tail,
            table_off,
            table_cap,
            bucket_off,
            bucket_cap,
            count,
        })
    }

    fn write_headers(&self) -> Result<(), StorageError> {
        let meta = *self.meta.read().unwrap();
        let mut header = [0_u8; BIN_HEADER_LEN];
        header[0..8].copy_from_slice(&BIN_MAGIC.to_be_bytes());
        header[8..12].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
        header[16..24].copy_from_slice(&meta.next_counter.to_be_bytes());
        header[24..32].copy_from_slice(&meta.tail.to_be_bytes());
        header[32..40].copy_from_slice(&meta.table_off.to_be_bytes());
        header[40..48].copy_from_slice(&meta.table_cap.to_be_bytes());
        let crc = crc32fast::hash(&header[..BIN_HEADER_LEN - 4]);
        header[BIN_HEADER_LEN - 4..].copy_from_slice(&crc.to_be_bytes());
        self.bin.write(0, &header)?;

        let mut header = [0_u8; HASH_HEADER_LEN];
        header[0..8].copy_from_slice(&HASH_MAGIC.to_be_bytes());
        header[8..12].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
        header[16..24].copy_from_slice(&meta.bucket_off.to_be_bytes());
        header[24..32].copy_from_slice(&meta.bucket_cap.to_be_bytes());
        header[32..40].copy_from_slice(&meta.count.to_be_bytes());
        let crc = crc32fast::hash(&header[..HASH_HEADER_LEN - 4]);
        header[HASH_HEADER_LEN - 4..].copy_from_slice(&crc.to_be_bytes());
        self.hash.write(0, &header)
    }

    /// Interns a term, returning the existing id if it is already present.
    pub fn intern(
        &self,
        kind: AtomKind,
        value: &[u8],
        datatype: Option<AtomId>,
        language: Option<&str>,
    ) -> Result<AtomId, StorageError> {
        if value.len() > MAX_ATOM_LEN {
            return Err(StorageError::AtomTooLarge(value.len(), MAX_ATOM_LEN));
        }
        let hash = content_hash(kind, value, datatype, language);
        if let Some(id) = self.probe(hash, kind, value, datatype, language)? {
            return Ok(id);
        }

        let mut meta = self.meta.write().unwrap();
        let counter = meta.next_counter;
        if counter >= MAX_COUNTER {
            return Err(StorageError::Other("atom id space exhausted".into()));
        }
        let id = AtomId::new(kind, counter);

        // Append the canonical record to the blob region.
        let offset = meta.tail;
        let mut record = Vec::with_capacity(8 + value.len() + 16);
        record.extend_from_slice(&u32::try_from(value.len()).unwrap().to_be_bytes());
        record.push(kind as u8);
        let mut flags = 0;
        if datatype.is_some() {
            flags |= FLAG_DATATYPE;
        }
        if language.is_some() {
            flags |= FLAG_LANG;
        }
        record.push(flags);
        record.push(u8::try_from(language.map_or(0, str::len)).map_err(|_| {
            StorageError::Other("language tag longer than 255 bytes".into())
        })?);
        record.push(0);
        if let Some(datatype) = datatype {
            record.extend_from_slice(&datatype.word().to_be_bytes());
        }
        if let Some(language) = language {
            record.extend_from_slice(language.as_bytes());
        }
        record.extend_from_slice(value);
        self.bin.ensure_len(offset + record.len() as u64)?;
        self.bin.write(offset, &record)?;
        meta.tail = offset + record.len() as u64;

        // Record the offset in the id table, doubling the extent if full.
        if counter >= meta.table_cap {
            let new_cap = meta.table_cap * 2;
            let new_off = meta.tail;
            self.bin.ensure_len(new_off + new_cap * 8)?;
            let old = self.bin.read(meta.table_off, usize::try_from(meta.table_cap * 8).unwrap())?;
            self.bin.write(new_off, &old)?;
            meta.table_off = new_off;
            meta.table_cap = new_cap;
            meta.tail = new_off + new_cap * 8;
        }
        let entry = (u64::from(kind as u8) << 62) | offset;
        self.bin.write(meta.table_off + counter * 8, &entry.to_be_bytes())?;
        meta.next_counter = counter + 1;

        // Insert into the hash index, resizing at 3/4 load.
        if (meta.count + 1) * 4 > meta.bucket_cap * 3 {
            self.grow_buckets(&mut meta)?;
        }
        self.bucket_insert(&meta, hash, id)?;
        meta.count += 1;
        Ok(id)
    }

    /// Looks a term up without interning it.
    pub fn lookup(
        &self,
        kind: AtomKind,
        value: &[u8],
        datatype: Option<AtomId>,
        language: Option<&str>,
    ) -> Result<Option<AtomId>, StorageError> {
        if value.len() > MAX_ATOM_LEN {
            return Ok(None);
        }
        let hash = content_hash(kind, value, datatype, language);
        self.probe(hash, kind, value, datatype, language)
    }

    fn probe(
        &self,
        hash: u64,
        kind: AtomKind,
        value: &[u8],
        datatype: Option<AtomId>,
        language: Option<&str>,
    ) -> Result<Option<AtomId>, StorageError> {
        let meta = *self.meta.read().unwrap();
        let mask = meta.bucket_cap - 1;
        let mut slot = hash & mask;
        loop {
            let raw = self.hash.read(meta.bucket_off + slot * 16, 16)?;
            let slot_hash = u64::from_be_bytes(raw[0..8].try_into().unwrap());
            let word = u64::from_be_bytes(raw[8..16].try_into().unwrap());
            if word == 0 {
                return Ok(None);
            }
            if slot_hash == hash {
                let candidate = AtomId::from_word(word);
                let record = self.resolve(candidate.counter())?;
                if record.kind == kind
                    && record.value == value
                    && record.datatype == datatype
                    && record.language.as_deref() == language
                {
                    return Ok(Some(candidate));
                }
            }
            slot = (slot + 1) & mask;
        }
    }

    fn bucket_insert(&self, meta: &AtomMeta, hash: u64, id: AtomId) -> Result<(), StorageError> {
        let mask = meta.bucket_cap - 1;
        let mut slot = hash & mask;
        loop {
            let raw = self.hash.read(meta.bucket_off + slot * 16, 16)?;
            if u64::from_be_bytes(raw[8..16].try_into().unwrap()) == 0 {
                let mut entry = [0_u8; 16];
                entry[0..8].copy_from_slice(&hash.to_be_bytes());
                entry[8..16].copy_from_slice(&id.word().to_be_bytes());
                return self.hash.write(meta.bucket_off + slot * 16, &entry);
            }
            slot = (slot + 1) & mask;
        }
    }

    fn grow_buckets(&self, meta: &mut AtomMeta) -> Result<(), StorageError> {
        let old_off = meta.bucket_off;
        let old_cap = meta.bucket_cap;
        let new_cap = old_cap * 2;
        let new_off = self.hash.len();
        self.hash.ensure_len(new_off + new_cap * 16)?;
        meta.bucket_off = new_off;
        meta.bucket_cap = new_cap;
        for slot in 0..old_cap {
            let raw = self.hash.read(old_off + slot * 16, 16)?;
            let hash = u64::from_be_bytes(raw[0..8].try_into().unwrap());
            let word = u64::from_be_bytes(raw[8..16].try_into().unwrap());
            if word != 0 {
                self.bucket_insert(meta, hash, AtomId::from_word(word))?;
            }
        }
        Ok(())
    }

    /// Resolves a counter into the stored record. Constant-time through the
    /// id table.
    pub fn resolve(&self, counter: u64) -> Result<AtomRecord, StorageError> {
        let entry = self.table_entry(counter)?;
        let offset = entry & ((1 << 56) - 1);
        let header = self.bin.read(offset, 8)?;
        let len = usize::try_from(u32::from_be_bytes(header[0..4].try_into().unwrap())).unwrap();
        if len > MAX_ATOM_LEN {
            return Err(
                CorruptionError::CorruptAtomIndex(format!("atom {counter} has length {len}")).into(),
            );
        }
        let kind = AtomKind::from_bits(u64::from(header[4]));
        let flags = header[5];
        let lang_len = usize::from(header[6]);
        let mut pos = offset + 8;
        let datatype = if flags & FLAG_DATATYPE != 0 {
            let raw = self.bin.read(pos, 8)?;
            pos += 8;
            Some(AtomId::from_word(u64::from_be_bytes(raw.try_into().unwrap())))
        } else {
            None
        };
        let language = if flags & FLAG_LANG != 0 {
            let raw = self.bin.read(pos, lang_len)?;
            pos += lang_len as u64;
            Some(String::from_utf8(raw).map_err(|_| {
                StorageError::from(CorruptionError::CorruptAtomIndex(format!(
                    "atom {counter} has a non-UTF-8 language tag"
                )))
            })?)
        } else {
            None
        };
        let value = self.bin.read(pos, len)?;
        Ok(AtomRecord {
            kind,
            value,
            datatype,
            language,
        })
    }

    /// Rebuilds the full [`AtomId`] of a counter from the id table.
    pub fn atom_id(&self, counter: u64) -> Result<AtomId, StorageError> {
        if counter == 0 {
            return Ok(AtomId::DEFAULT_GRAPH);
        }
        let entry = self.table_entry(counter)?;
        Ok(AtomId::new(AtomKind::from_bits(entry >> 62), counter))
    }

    fn table_entry(&self, counter: u64) -> Result<u64, StorageError> {
        let meta = self.meta.read().unwrap();
        if counter == 0 || counter >= meta.next_counter {
            return Err(CorruptionError::CorruptAtomIndex(format!(
                "atom counter {counter} is out of range"
            ))
            .into());
        }
        let raw = self.bin.read(meta.table_off + counter * 8, 8)?;
        Ok(u64::from_be_bytes(raw.try_into().unwrap()))
    }

    /// The counter one past the last allocated atom.
    pub fn next_counter(&self) -> u64 {
        self.meta.read().unwrap().next_counter
    }

    /// Lazy, restartable enumeration of the interned atoms, optionally
    /// restricted to one kind.
    pub fn iter(
        &self,
        kind: Option<AtomKind>,
    ) -> impl Iterator<Item = Result<AtomId, StorageError>> + '_ {
        (1..self.next_counter()).filter_map(move |counter| match self.atom_id(counter) {
            Ok(id) => (kind.is_none() || kind == Some(id.kind())).then_some(Ok(id)),
            Err(e) => Some(Err(e)),
        })
    }

    pub fn len(&self) -> u64 {
        self.meta.read().unwrap().count
    }

    /// Flushes appended bytes and both headers. Called before the commit's
    /// WAL fsync so replayed operations always resolve their atoms.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.write_headers()?;
        self.bin.flush()?;
        self.hash.flush()
    }
}

fn check_magic(header: &[u8], magic: u64, file: &str) -> Result<(), StorageError> {
    if u64::from_be_bytes(header[0..8].try_into().unwrap()) != magic {
        return Err(CorruptionError::BadHeader {
            file: file.into(),
            reason: "bad magic number".into(),
        }
        .into());
    }
    let version = u32::from_be_bytes(header[8..12].try_into().unwrap());
    if version > FORMAT_VERSION {
        return Err(CorruptionError::BadHeader {
            file: file.into(),
            reason: format!("format version {version} is newer than the supported {FORMAT_VERSION}"),
        }
        .into());
    }
    Ok(())
}

fn content_hash(
    kind: AtomKind,
    value: &[u8],
    datatype: Option<AtomId>,
    language: Option<&str>,
) -> u64 {
    let mut hash = FNV_OFFSET;
    let mut feed = |bytes: &[u8]| {
        for b in bytes {
            hash ^= u64::from(*b);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    };
    feed(&[kind as u8]);
    feed(&u32::try_from(value.len()).unwrap_or(u32::MAX).to_le_bytes());
    feed(value);
    if let Some(datatype) = datatype {
        feed(&datatype.word().to_le_bytes());
    }
    if let Some(language) = language {
        feed(language.as_bytes());
    }
    hash
}

/// A raw memory-mapped append file, shared by the blob and hash regions.
struct RawMapped {
    file: File,
    map: RwLock<MmapMut>,
    name: String,
}

impl RawMapped {
    #[allow(unsafe_code)]
    fn open(path: &Path, initial_len: u64) -> Result<(Self, bool), StorageError> {
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
            file.set_len(initial_len)?;
        }
        // SAFETY: protected by the store's exclusive OS lock.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok((
            Self {
                file,
                map: RwLock::new(map),
                name,
            },
            is_new,
        ))
    }

    fn len(&self) -> u64 {
        self.map.read().unwrap().len() as u64
    }

    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, StorageError> {
        let map = self.map.read().unwrap();
        let start = usize::try_from(offset).unwrap();
        map.get(start..start + len)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                CorruptionError::CorruptAtomIndex(format!(
                    "read of {len} bytes at {offset} is beyond the end of {}",
                    self.name
                ))
                .into()
            })
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        let mut map = self.map.write().unwrap();
        let start = usize::try_from(offset).unwrap();
        let Some(bytes) = map.get_mut(start..start + data.len()) else {
            return Err(CorruptionError::CorruptAtomIndex(format!(
                "write of {} bytes at {offset} is beyond the end of {}",
                data.len(),
                self.name
            ))
            .into());
        };
        bytes.copy_from_slice(data);
        Ok(())
    }

    #[allow(unsafe_code)]
    fn ensure_len(&self, len: u64) -> Result<(), StorageError> {
        let mut map = self.map.write().unwrap();
        if (map.len() as u64) < len {
            let new_len = len.max(map.len() as u64 * 2);
            map.flush()?;
            self.file.set_len(new_len)?;
            // SAFETY: protected by the store's exclusive OS lock.
            *map = unsafe { MmapMut::map_mut(&self.file)? };
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.map.read().unwrap().flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, AtomStore) {
        let dir = tempfile::tempdir().unwrap();
        let atoms = AtomStore::open(dir.path()).unwrap();
        (dir, atoms)
    }

    #[test]
    fn intern_is_idempotent() {
        let (_dir, atoms) = store();
        let a = atoms
            .intern(AtomKind::NamedNode, b"http://example.com/a", None, None)
            .unwrap();
        let b = atoms
            .intern(AtomKind::NamedNode, b"http://example.com/a", None, None)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(atoms.len(), 1);
    }

    #[test]
    fn resolve_round_trips() {
        let (_dir, atoms) = store();
        let dt = atoms
            .intern(AtomKind::NamedNode, b"http://www.w3.org/2001/XMLSchema#integer", None, None)
            .unwrap();
        let id = atoms
            .intern(AtomKind::Literal, b"42", Some(dt), None)
            .unwrap();
        let record = atoms.resolve(id.counter()).unwrap();
        assert_eq!(record.kind, AtomKind::Literal);
        assert_eq!(record.value, b"42");
        assert_eq!(record.datatype, Some(dt));
        assert_eq!(record.language, None);
    }

    #[test]
    fn same_value_different_kind_gets_different_ids() {
        let (_dir, atoms) = store();
        let iri = atoms.intern(AtomKind::NamedNode, b"x", None, None).unwrap();
        let lit = atoms.intern(AtomKind::Literal, b"x", None, None).unwrap();
        assert_ne!(iri, lit);
        assert_eq!(iri.kind(), AtomKind::NamedNode);
        assert_eq!(lit.kind(), AtomKind::Literal);
    }

    #[test]
    fn language_tags_discriminate() {
        let (_dir, atoms) = store();
        let en = atoms
            .intern(AtomKind::Literal, b"color", None, Some("en"))
            .unwrap();
        let en_gb = atoms
            .intern(AtomKind::Literal, b"color", None, Some("en-GB"))
            .unwrap();
        assert_ne!(en, en_gb);
        assert_eq!(
            atoms.lookup(AtomKind::Literal, b"color", None, Some("en")).unwrap(),
            Some(en)
        );
    }

    #[test]
    fn survives_reopen_and_hash_growth() {
        let dir = tempfile::tempdir().unwrap();
        let mut ids = Vec::new();
        {
            let atoms = AtomStore::open(dir.path()).unwrap();
            for i in 0..10_000_u32 {
                let value = format!("http://example.com/{i}");
                ids.push(
                    atoms
                        .intern(AtomKind::NamedNode, value.as_bytes(), None, None)
                        .unwrap(),
                );
            }
            atoms.flush().unwrap();
        }
        let atoms = AtomStore::open(dir.path()).unwrap();
        for (i, id) in ids.iter().enumerate() {
            let record = atoms.resolve(id.counter()).unwrap();
            assert_eq!(record.value, format!("http://example.com/{i}").into_bytes());
        }
        assert_eq!(
            atoms
                .lookup(AtomKind::NamedNode, b"http://example.com/77", None, None)
                .unwrap(),
            Some(ids[77])
        );
    }

    #[test]
    fn iteration_filters_by_kind() {
        let (_dir, atoms) = store();
        let iri = atoms.intern(AtomKind::NamedNode, b"i", None, None).unwrap();
        let lit = atoms.intern(AtomKind::Literal, b"l", None, None).unwrap();
        let blank = atoms.intern(AtomKind::BlankNode, b"b", None, None).unwrap();
        let all: Vec<_> = atoms.iter(None).collect::<Result<_, _>>().unwrap();
        assert_eq!(all, vec![iri, lit, blank]);
        let literals: Vec<_> = atoms
            .iter(Some(AtomKind::Literal))
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(literals, vec![lit]);
    }

    #[test]
    fn oversized_atom_is_refused() {
        let (_dir, atoms) = store();
        let huge = vec![b'x'; MAX_ATOM_LEN + 1];
        assert!(matches!(
            atoms.intern(AtomKind::Literal, &huge, None, None),
            Err(StorageError::AtomTooLarge(..))
        ));
    }
}
