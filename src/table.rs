//! Two-level displacement MPH table: "hash, displace, compress".
//!
//! Level-0 stores one searched seed per bucket, level-1 stores key indices.
//! A lookup hashes the query twice (seed 0, then the bucket's seed) and
//! confirms the resolved index by comparing against the stored key, so a
//! table never reports a false positive.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use hashbrown::{HashMap, HashSet};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::bucket::BucketSet;
use crate::error::MphError;
use crate::hash::murmur3;
use crate::keys::{FileKeys, KeyStore};

/// Immutable minimal perfect hash table over a fixed key corpus.
///
/// `lookup` maps the i-th build key back to `i`; keys outside the corpus
/// miss. File-backed tables own their keys-file handle and read it
/// positionally, so a table is safe to share across threads.
#[derive(Debug)]
pub struct Table {
    keys: KeyStore,
    level0: Vec<u32>,
    level0_mask: u32,
    level1: Vec<u32>,
    level1_mask: u32,
}

impl Table {
    /// Builds a table over `keys`; the i-th key will look up as index `i`.
    /// Keys may have different lengths but must be distinct.
    pub fn build(keys: Vec<Vec<u8>>) -> Result<Self, MphError> {
        let n = keys.len();
        if n > u32::MAX as usize {
            return Err(MphError::InvalidArgument(
                "key count exceeds u32 index range".into(),
            ));
        }
        let level0_len = next_pow2(n / 4);
        let level1_len = next_pow2(n);
        let level0_mask = (level0_len - 1) as u32;
        let level1_mask = (level1_len - 1) as u32;

        let mut buckets = BucketSet::new(level0_len);
        for (i, key) in keys.iter().enumerate() {
            buckets.insert((murmur3(0, key) & level0_mask) as usize, i as u32);
        }

        let mut level0 = vec![0u32; level0_len];
        let mut level1 = vec![0u32; level1_len];
        let mut occ = vec![false; level1_len];
        let mut tmp = Vec::new();
        let mut bucket_keys: Vec<&[u8]> = Vec::new();
        for bucket in buckets.into_ordered() {
            bucket_keys.clear();
            bucket_keys.extend(bucket.keys.iter().map(|&i| keys[i as usize].as_slice()));
            let seed = place_bucket(
                &bucket_keys,
                &bucket.keys,
                &mut occ,
                &mut level1,
                level1_mask,
                &mut tmp,
            )?;
            level0[bucket.slot as usize] = seed;
        }
        debug!("mph table built: keys={n}, level0={level0_len}, level1={level1_len}");

        Ok(Self {
            keys: KeyStore::Mem(keys),
            level0,
            level0_mask,
            level1,
            level1_mask,
        })
    }

    /// [`Table::build`] over any iterable of byte-string-like keys.
    pub fn build_from_iter<I, K>(keys: I) -> Result<Self, MphError>
    where
        I: IntoIterator<Item = K>,
        K: Into<Vec<u8>>,
    {
        Self::build(keys.into_iter().map(Into::into).collect())
    }

    /// Builds a table over a file of `key_len`-byte records without holding
    /// the corpus in memory: one sequential pass assigns buckets by index,
    /// then each bucket's keys are fetched by offset only while its seed is
    /// being searched. The table retains a read handle for lookups.
    pub fn build_from_keys_file(path: impl AsRef<Path>, key_len: usize) -> Result<Self, MphError> {
        let fk = FileKeys::open(path.as_ref(), key_len)?;
        if fk.num_keys() > u32::MAX as u64 {
            return Err(MphError::InvalidArgument(
                "key count exceeds u32 index range".into(),
            ));
        }
        let n = fk.num_keys() as usize;
        let level0_len = next_pow2(n / 4);
        let level1_len = next_pow2(n);
        let level0_mask = (level0_len - 1) as u32;
        let level1_mask = (level1_len - 1) as u32;

        let mut buckets = BucketSet::new(level0_len);
        fk.scan(|i, key| buckets.insert((murmur3(0, key) & level0_mask) as usize, i))?;

        let mut level0 = vec![0u32; level0_len];
        let mut level1 = vec![0u32; level1_len];
        let mut occ = vec![false; level1_len];
        let mut tmp = Vec::new();
        let mut cache: HashMap<u32, Vec<u8>> = HashMap::new();
        for bucket in buckets.into_ordered() {
            cache.clear();
            for &i in &bucket.keys {
                cache.insert(i, fk.key_at(i as u64)?);
            }
            let bucket_keys: Vec<&[u8]> =
                bucket.keys.iter().map(|&i| cache[&i].as_slice()).collect();
            let seed = place_bucket(
                &bucket_keys,
                &bucket.keys,
                &mut occ,
                &mut level1,
                level1_mask,
                &mut tmp,
            )?;
            level0[bucket.slot as usize] = seed;
        }
        debug!(
            "mph table built from {}: keys={n}, level0={level0_len}, level1={level1_len}",
            fk.path().display()
        );

        Ok(Self {
            keys: KeyStore::File(fk),
            level0,
            level0_mask,
            level1,
            level1_mask,
        })
    }

    /// Resolves `query` to its build index, or `None` if it is not a member.
    /// Internal read failures on file-backed corpora report a miss.
    pub fn lookup(&self, query: &[u8]) -> Option<u32> {
        let i0 = (murmur3(0, query) & self.level0_mask) as usize;
        let seed = self.level0[i0];
        let i1 = (murmur3(seed, query) & self.level1_mask) as usize;
        let n = self.level1[i1];
        match &self.keys {
            KeyStore::Mem(keys) => {
                let stored = keys.get(n as usize)?;
                (stored.as_slice() == query).then_some(n)
            }
            KeyStore::File(fk) => {
                if u64::from(n) >= fk.num_keys() {
                    return None;
                }
                let stored = fk.key_at(u64::from(n)).ok()?;
                (stored == query).then_some(n)
            }
        }
    }

    #[inline]
    pub fn lookup_str(&self, query: &str) -> Option<u32> {
        self.lookup(query.as_bytes())
    }

    /// Number of keys in the table.
    pub fn len(&self) -> usize {
        self.keys.num_keys() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn memory_usage_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.level0.len() * std::mem::size_of::<u32>()
            + self.level1.len() * std::mem::size_of::<u32>()
            + self.keys.heap_bytes()
    }

    /// Writes a self-contained dump. In-memory corpora are embedded;
    /// file-backed tables record the keys-file path instead.
    pub fn dump_to_file(&self, path: impl AsRef<Path>) -> Result<(), MphError> {
        let mut w = BufWriter::new(File::create(path)?);
        bincode::serialize_into(&mut w, &self.dump_record())?;
        w.flush()?;
        Ok(())
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, MphError> {
        let rec: TableRecord = bincode::deserialize_from(BufReader::new(File::open(path)?))?;
        Self::from_record(rec)
    }

    /// Appends the level arrays to the table's own keys file, terminated by
    /// the 8-byte `[u32 LE key_len][u32 LE num_keys]` footer, so file and
    /// table travel together. Only valid for file-backed tables.
    pub fn dump_to_keys_file(&self) -> Result<(), MphError> {
        let KeyStore::File(fk) = &self.keys else {
            return Err(MphError::InvalidArgument(
                "table does not reference a keys file".into(),
            ));
        };
        if fk.num_keys() > u32::MAX as u64 {
            return Err(MphError::InvalidArgument(
                "key count exceeds the u32 footer range".into(),
            ));
        }
        let mut w = BufWriter::new(OpenOptions::new().append(true).open(fk.path())?);
        bincode::serialize_into(
            &mut w,
            &LevelsDumpRef {
                level0: &self.level0,
                level0_mask: self.level0_mask,
                level1: &self.level1,
                level1_mask: self.level1_mask,
            },
        )?;
        w.write_all(&(fk.key_len() as u32).to_le_bytes())?;
        w.write_all(&(fk.num_keys() as u32).to_le_bytes())?;
        w.flush()?;
        Ok(())
    }

    /// Reconstructs a table from a keys file produced by
    /// [`Table::dump_to_keys_file`]: the footer locates the level arrays,
    /// which sit just past `num_keys * key_len` bytes of raw keys.
    pub fn load_from_keys_file(path: impl AsRef<Path>) -> Result<Self, MphError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len < 8 {
            return Err(MphError::MalformedInput(
                "keys file too short for a footer".into(),
            ));
        }
        let mut footer = [0u8; 8];
        file.read_exact_at(&mut footer, file_len - 8)?;
        let key_len = u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]) as usize;
        let num_keys = u32::from_le_bytes([footer[4], footer[5], footer[6], footer[7]]) as u64;
        if key_len == 0 {
            return Err(MphError::MalformedInput("zero key length in footer".into()));
        }
        let levels_at = num_keys * key_len as u64;
        if levels_at > file_len - 8 {
            return Err(MphError::MalformedInput(
                "footer is inconsistent with the file size".into(),
            ));
        }
        let mut reader = BufReader::new(&file);
        reader.seek(SeekFrom::Start(levels_at))?;
        let levels: LevelsRecord = bincode::deserialize_from(&mut reader)?;
        check_levels(
            &levels.level0,
            levels.level0_mask,
            &levels.level1,
            levels.level1_mask,
        )?;
        let fk = FileKeys::open_prefix(path, key_len, num_keys)?;
        Ok(Self {
            keys: KeyStore::File(fk),
            level0: levels.level0,
            level0_mask: levels.level0_mask,
            level1: levels.level1,
            level1_mask: levels.level1_mask,
        })
    }

    pub(crate) fn dump_record(&self) -> TableDumpRef<'_> {
        let (keys, key_len, num_keys) = match &self.keys {
            KeyStore::Mem(keys) => (KeysDumpRef::Embedded(keys), 0, 0),
            KeyStore::File(fk) => (
                KeysDumpRef::External(fk.path()),
                fk.key_len() as u64,
                fk.num_keys(),
            ),
        };
        TableDumpRef {
            keys,
            key_len,
            num_keys,
            level0: &self.level0,
            level0_mask: self.level0_mask,
            level1: &self.level1,
            level1_mask: self.level1_mask,
        }
    }

    pub(crate) fn from_record(rec: TableRecord) -> Result<Self, MphError> {
        check_levels(&rec.level0, rec.level0_mask, &rec.level1, rec.level1_mask)?;
        let keys = match rec.keys {
            KeysRecord::Embedded(keys) => KeyStore::Mem(keys),
            KeysRecord::External(path) => KeyStore::File(FileKeys::open_prefix(
                &path,
                rec.key_len as usize,
                rec.num_keys,
            )?),
        };
        Ok(Self {
            keys,
            level0: rec.level0,
            level0_mask: rec.level0_mask,
            level1: rec.level1,
            level1_mask: rec.level1_mask,
        })
    }
}

/// Searches seeds `0, 1, 2, …` until every key in the bucket lands on a free
/// level-1 slot. Slots taken during a failed attempt are rolled back before
/// the next seed. Byte-equal keys always share a bucket and can never be
/// separated, so they fail fast instead of exhausting the budget.
fn place_bucket(
    keys: &[&[u8]],
    idxs: &[u32],
    occ: &mut [bool],
    level1: &mut [u32],
    level1_mask: u32,
    tmp: &mut Vec<u32>,
) -> Result<u32, MphError> {
    if keys.len() > 1 {
        let mut seen: HashSet<&[u8]> = HashSet::with_capacity(keys.len());
        for &key in keys {
            if !seen.insert(key) {
                return Err(MphError::DuplicateKey);
            }
        }
    }

    let mut seed = 0u32;
    loop {
        tmp.clear();
        let mut placed_all = true;
        for (&key, &idx) in keys.iter().zip(idxs) {
            let slot = (murmur3(seed, key) & level1_mask) as usize;
            if occ[slot] {
                placed_all = false;
                break;
            }
            occ[slot] = true;
            level1[slot] = idx;
            tmp.push(slot as u32);
        }
        if placed_all {
            return Ok(seed);
        }
        for &slot in tmp.iter() {
            occ[slot as usize] = false;
        }
        seed = seed.checked_add(1).ok_or(MphError::Unbuildable)?;
    }
}

/// Smallest power of two >= `n`, minimum 1.
fn next_pow2(n: usize) -> usize {
    let mut p = 1;
    while p < n {
        p *= 2;
    }
    p
}

fn check_levels(
    level0: &[u32],
    level0_mask: u32,
    level1: &[u32],
    level1_mask: u32,
) -> Result<(), MphError> {
    if level0.len() != level0_mask as usize + 1 || level1.len() != level1_mask as usize + 1 {
        return Err(MphError::MalformedInput(
            "level arrays do not match their masks".into(),
        ));
    }
    Ok(())
}

#[derive(Serialize)]
enum KeysDumpRef<'a> {
    Embedded(&'a Vec<Vec<u8>>),
    External(&'a Path),
}

#[derive(Deserialize)]
enum KeysRecord {
    Embedded(Vec<Vec<u8>>),
    External(PathBuf),
}

#[derive(Serialize)]
pub(crate) struct TableDumpRef<'a> {
    keys: KeysDumpRef<'a>,
    key_len: u64,
    num_keys: u64,
    level0: &'a [u32],
    level0_mask: u32,
    level1: &'a [u32],
    level1_mask: u32,
}

#[derive(Deserialize)]
pub(crate) struct TableRecord {
    keys: KeysRecord,
    key_len: u64,
    num_keys: u64,
    level0: Vec<u32>,
    level0_mask: u32,
    level1: Vec<u32>,
    level1_mask: u32,
}

#[derive(Serialize)]
struct LevelsDumpRef<'a> {
    level0: &'a [u32],
    level0_mask: u32,
    level1: &'a [u32],
    level1_mask: u32,
}

#[derive(Deserialize)]
struct LevelsRecord {
    level0: Vec<u32>,
    level0_mask: u32,
    level1: Vec<u32>,
    level1_mask: u32,
}
