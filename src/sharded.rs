//! Prefix-sharded tables: route keys to `2^pref_bits` independent MPH
//! tables, either built in memory or spilled to per-shard files and rebuilt
//! from disk at commit.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::MphError;
use crate::shard::{check_prefix_fits, num_shards, shard_index, suffix, validate_pref_bits};
use crate::table::{Table, TableDumpRef, TableRecord};

const DEFAULT_BUF_SIZE: usize = 1 << 20;

/// Settings for a streaming spill build.
#[derive(Debug, Clone)]
pub struct SpillConfig {
    /// Fixed length of every ingested key, in bytes.
    pub key_len: usize,
    /// Number of leading key bits forming the shard index.
    pub pref_bits: u32,
    /// Store only the key suffix beyond the routed prefix.
    pub suffix_only: bool,
    /// Write-buffer capacity per shard file.
    pub buf_size: usize,
}

impl SpillConfig {
    pub fn new(key_len: usize, pref_bits: u32) -> Self {
        Self {
            key_len,
            pref_bits,
            suffix_only: false,
            buf_size: DEFAULT_BUF_SIZE,
        }
    }

    pub fn with_suffix_only(mut self, suffix_only: bool) -> Self {
        self.suffix_only = suffix_only;
        self
    }

    pub fn with_buf_size(mut self, buf_size: usize) -> Self {
        self.buf_size = buf_size;
        self
    }

    fn validate(&self) -> Result<(), MphError> {
        validate_pref_bits(self.pref_bits)?;
        if self.key_len == 0 {
            return Err(MphError::InvalidArgument("key length must be >= 1".into()));
        }
        if self.buf_size == 0 {
            return Err(MphError::InvalidArgument(
                "write buffer size must be >= 1".into(),
            ));
        }
        check_prefix_fits(self.key_len, self.pref_bits)?;
        if self.suffix_only && self.stored_len() == 0 {
            return Err(MphError::InvalidArgument(
                "suffix-only prefix consumes the entire key".into(),
            ));
        }
        Ok(())
    }

    /// Length of each record in the spill files.
    fn stored_len(&self) -> usize {
        if self.suffix_only {
            self.key_len - (self.pref_bits / 8) as usize
        } else {
            self.key_len
        }
    }
}

/// Open-state streaming builder: keys are routed and appended to lazily
/// created `<dir>/<shard>.bin` files. `commit` consumes the builder, so
/// nothing can be ingested into a committed table.
#[derive(Debug)]
pub struct ShardedBuilder {
    config: SpillConfig,
    dir: PathBuf,
    writers: Vec<Option<BufWriter<File>>>,
    paths: Vec<Option<PathBuf>>,
    counts: Vec<u64>,
}

impl ShardedBuilder {
    /// `dir` is the spill directory; it must exist and must not be shared
    /// with another builder.
    pub fn new(config: SpillConfig, dir: impl Into<PathBuf>) -> Result<Self, MphError> {
        config.validate()?;
        let slots = num_shards(config.pref_bits);
        Ok(Self {
            config,
            dir: dir.into(),
            writers: (0..slots).map(|_| None).collect(),
            paths: vec![None; slots],
            counts: vec![0; slots],
        })
    }

    /// Routes `key` to its shard file. The key must have the configured
    /// fixed length.
    pub fn put(&mut self, key: &[u8]) -> Result<(), MphError> {
        if key.len() != self.config.key_len {
            return Err(MphError::InvalidArgument(format!(
                "key length {} does not match configured length {}",
                key.len(),
                self.config.key_len
            )));
        }
        let shard = shard_index(key, self.config.pref_bits)?;
        if self.config.suffix_only {
            let suf = suffix(key, self.config.pref_bits)?;
            self.append(shard, &suf)?;
        } else {
            self.append(shard, key)?;
        }
        self.counts[shard] += 1;
        Ok(())
    }

    fn append(&mut self, shard: usize, record: &[u8]) -> Result<(), MphError> {
        if self.writers[shard].is_none() {
            let path = self.dir.join(format!("{shard}.bin"));
            let file = File::create(&path)?;
            self.writers[shard] = Some(BufWriter::with_capacity(self.config.buf_size, file));
            self.paths[shard] = Some(path);
        }
        if let Some(writer) = self.writers[shard].as_mut() {
            writer.write_all(record)?;
        }
        Ok(())
    }

    /// Flushes every shard file and builds its table from disk, on the pool
    /// when one is given. The spill files stay on disk: the shard tables
    /// read them for lookup equality checks.
    pub fn commit(mut self, pool: Option<&rayon::ThreadPool>) -> Result<ShardedTable, MphError> {
        let stored_len = self.config.stored_len();
        let mut jobs: Vec<(usize, PathBuf)> = Vec::new();
        for shard in 0..self.writers.len() {
            let Some(mut writer) = self.writers[shard].take() else {
                continue;
            };
            writer.flush()?;
            if let Some(path) = self.paths[shard].clone() {
                jobs.push((shard, path));
            }
        }
        debug!(
            "committing {} spilled shards under {}",
            jobs.len(),
            self.dir.display()
        );

        let built = run_jobs(jobs, pool, move |path: PathBuf| {
            Table::build_from_keys_file(&path, stored_len)
        })?;
        let mut tables: Vec<Option<Table>> = (0..self.counts.len()).map(|_| None).collect();
        for (shard, table) in built {
            tables[shard] = Some(table);
        }
        Ok(ShardedTable {
            counts: self.counts,
            pref_bits: self.config.pref_bits,
            suffix_only: self.config.suffix_only,
            tables,
            disk: Some(DiskLayout {
                key_len: self.config.key_len,
                dir: self.dir,
                paths: self.paths,
            }),
        })
    }
}

#[derive(Debug)]
struct DiskLayout {
    key_len: usize,
    dir: PathBuf,
    paths: Vec<Option<PathBuf>>,
}

/// A committed sharded table. Lookups route the query to its shard and
/// delegate; empty shards miss. Immutable, so freely shared across threads.
#[derive(Debug)]
pub struct ShardedTable {
    counts: Vec<u64>,
    pref_bits: u32,
    suffix_only: bool,
    tables: Vec<Option<Table>>,
    disk: Option<DiskLayout>,
}

impl ShardedTable {
    /// Routes `keys` into per-shard corpora and builds every non-empty
    /// shard, in parallel when `pool` is given. Any shard failure fails the
    /// whole build. With `suffix_only`, shards store (and index) only the
    /// key bytes beyond the routed prefix.
    pub fn build<K: AsRef<[u8]>>(
        keys: &[K],
        pref_bits: u32,
        suffix_only: bool,
        pool: Option<&rayon::ThreadPool>,
    ) -> Result<Self, MphError> {
        validate_pref_bits(pref_bits)?;
        let slots = num_shards(pref_bits);
        let mut counts = vec![0u64; slots];
        let mut pending: HashMap<usize, Vec<Vec<u8>>> = HashMap::new();
        for key in keys {
            let key = key.as_ref();
            let shard = shard_index(key, pref_bits)?;
            let stored = if suffix_only {
                suffix(key, pref_bits)?
            } else {
                key.to_vec()
            };
            pending.entry(shard).or_default().push(stored);
            counts[shard] += 1;
        }
        let mut jobs: Vec<(usize, Vec<Vec<u8>>)> = pending.into_iter().collect();
        jobs.sort_unstable_by_key(|&(shard, _)| shard);
        debug!("building {} occupied shards of {slots}", jobs.len());

        let built = run_jobs(jobs, pool, Table::build)?;
        let mut tables: Vec<Option<Table>> = (0..slots).map(|_| None).collect();
        for (shard, table) in built {
            tables[shard] = Some(table);
        }
        Ok(Self {
            counts,
            pref_bits,
            suffix_only,
            tables,
            disk: None,
        })
    }

    /// Resolves `query` to its index within its shard, or `None` for
    /// non-members, unroutable keys, and (in streaming mode) queries of the
    /// wrong fixed length.
    pub fn lookup(&self, query: &[u8]) -> Option<u32> {
        if let Some(disk) = &self.disk {
            if query.len() != disk.key_len {
                return None;
            }
        }
        let shard = shard_index(query, self.pref_bits).ok()?;
        let table = self.tables[shard].as_ref()?;
        if self.suffix_only {
            table.lookup(&suffix(query, self.pref_bits).ok()?)
        } else {
            table.lookup(query)
        }
    }

    /// Per-shard key counts; the occupied shards are exactly the non-zero
    /// entries.
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Total number of keys across all shards.
    pub fn len(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pref_bits(&self) -> u32 {
        self.pref_bits
    }

    pub fn suffix_only(&self) -> bool {
        self.suffix_only
    }

    pub fn memory_usage_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.counts.len() * std::mem::size_of::<u64>()
            + self
                .tables
                .iter()
                .flatten()
                .map(Table::memory_usage_bytes)
                .sum::<usize>()
    }

    /// Writes a self-contained sharded dump. In-memory shard tables are
    /// embedded; spilled tables are appended to their own shard files and
    /// the dump records the file layout instead.
    pub fn dump_to_file(&self, path: impl AsRef<Path>) -> Result<(), MphError> {
        let store = match &self.disk {
            Some(disk) => StoreDumpRef::Disk {
                key_len: disk.key_len as u64,
                dir: &disk.dir,
                paths: &disk.paths,
            },
            None => StoreDumpRef::Mem(
                self.tables
                    .iter()
                    .map(|t| t.as_ref().map(Table::dump_record))
                    .collect(),
            ),
        };
        let record = ShardedDumpRef {
            counts: &self.counts,
            pref_bits: self.pref_bits,
            suffix_only: self.suffix_only,
            store,
        };
        let mut w = BufWriter::new(File::create(path)?);
        bincode::serialize_into(&mut w, &record)?;
        w.flush()?;
        if self.disk.is_some() {
            for table in self.tables.iter().flatten() {
                table.dump_to_keys_file()?;
            }
        }
        Ok(())
    }

    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, MphError> {
        let record: ShardedRecord = bincode::deserialize_from(BufReader::new(File::open(path)?))?;
        validate_pref_bits(record.pref_bits)?;
        let slots = num_shards(record.pref_bits);
        if record.counts.len() != slots {
            return Err(MphError::MalformedInput(
                "shard counts do not match the prefix width".into(),
            ));
        }
        match record.store {
            StoreRecord::Mem(recs) => {
                if recs.len() != slots {
                    return Err(MphError::MalformedInput(
                        "shard tables do not match the prefix width".into(),
                    ));
                }
                let mut tables = Vec::with_capacity(slots);
                for rec in recs {
                    tables.push(rec.map(Table::from_record).transpose()?);
                }
                Ok(Self {
                    counts: record.counts,
                    pref_bits: record.pref_bits,
                    suffix_only: record.suffix_only,
                    tables,
                    disk: None,
                })
            }
            StoreRecord::Disk {
                key_len,
                dir,
                paths,
            } => {
                if paths.len() != slots {
                    return Err(MphError::MalformedInput(
                        "shard file paths do not match the prefix width".into(),
                    ));
                }
                let mut tables: Vec<Option<Table>> = (0..slots).map(|_| None).collect();
                for (shard, &count) in record.counts.iter().enumerate() {
                    if count == 0 {
                        continue;
                    }
                    let Some(path) = &paths[shard] else {
                        return Err(MphError::MalformedInput(format!(
                            "missing spill file path for shard {shard}"
                        )));
                    };
                    tables[shard] = Some(Table::load_from_keys_file(path)?);
                }
                Ok(Self {
                    counts: record.counts,
                    pref_bits: record.pref_bits,
                    suffix_only: record.suffix_only,
                    tables,
                    disk: Some(DiskLayout {
                        key_len: key_len as usize,
                        dir,
                        paths,
                    }),
                })
            }
        }
    }
}

/// Runs one fallible job per occupied shard: on the pool with
/// first-error-wins collection, or serially without one. No partial result
/// escapes a failed run.
fn run_jobs<T, R, F>(
    jobs: Vec<(usize, T)>,
    pool: Option<&rayon::ThreadPool>,
    f: F,
) -> Result<Vec<(usize, R)>, MphError>
where
    T: Send,
    R: Send,
    F: Fn(T) -> Result<R, MphError> + Send + Sync,
{
    match pool {
        Some(pool) => pool.install(|| {
            jobs.into_par_iter()
                .map(|(shard, job)| f(job).map(|table| (shard, table)))
                .collect()
        }),
        None => jobs
            .into_iter()
            .map(|(shard, job)| f(job).map(|table| (shard, table)))
            .collect(),
    }
}

#[derive(Serialize)]
struct ShardedDumpRef<'a> {
    counts: &'a [u64],
    pref_bits: u32,
    suffix_only: bool,
    store: StoreDumpRef<'a>,
}

#[derive(Serialize)]
enum StoreDumpRef<'a> {
    Mem(Vec<Option<TableDumpRef<'a>>>),
    Disk {
        key_len: u64,
        dir: &'a Path,
        paths: &'a [Option<PathBuf>],
    },
}

#[derive(Deserialize)]
struct ShardedRecord {
    counts: Vec<u64>,
    pref_bits: u32,
    suffix_only: bool,
    store: StoreRecord,
}

#[derive(Deserialize)]
enum StoreRecord {
    Mem(Vec<Option<TableRecord>>),
    Disk {
        key_len: u64,
        dir: PathBuf,
        paths: Vec<Option<PathBuf>>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    /// The 16-bit corpus routed by its top 3 bits: shards {2,3,6,7} with
    /// sizes {2,1,2,2}.
    fn corpus() -> Vec<Vec<u8>> {
        [0xC001u16, 0xE002, 0x6006, 0x4003, 0xE007, 0x4004, 0xC005]
            .iter()
            .map(|k| k.to_be_bytes().to_vec())
            .collect()
    }

    fn per_shard_full() -> Vec<(usize, Vec<Vec<u8>>)> {
        vec![
            (2, vec![0x4003u16, 0x4004]),
            (3, vec![0x6006]),
            (6, vec![0xC001, 0xC005]),
            (7, vec![0xE002, 0xE007]),
        ]
        .into_iter()
        .map(|(s, ks)| (s, ks.iter().map(|k| k.to_be_bytes().to_vec()).collect()))
        .collect()
    }

    fn per_shard_suffixes() -> Vec<(usize, Vec<Vec<u8>>)> {
        vec![
            (2, vec![0x0003u16, 0x0004]),
            (3, vec![0x0006]),
            (6, vec![0x0001, 0x0005]),
            (7, vec![0x0002, 0x0007]),
        ]
        .into_iter()
        .map(|(s, ks)| (s, ks.iter().map(|k| k.to_be_bytes().to_vec()).collect()))
        .collect()
    }

    fn check_sharded(st: &ShardedTable, expected: &[(usize, Vec<Vec<u8>>)]) {
        assert_eq!(st.counts().len(), 8);
        assert_eq!(st.len(), 7);
        let occupied: Vec<usize> = st
            .counts()
            .iter()
            .enumerate()
            .filter(|(_, &c)| c > 0)
            .map(|(s, _)| s)
            .collect();
        assert_eq!(occupied, vec![2, 3, 6, 7]);
        assert_eq!(st.counts()[2], 2);
        assert_eq!(st.counts()[3], 1);
        assert_eq!(st.counts()[6], 2);
        assert_eq!(st.counts()[7], 2);

        for key in corpus() {
            assert!(st.lookup(&key).is_some(), "member {key:?}");
        }
        for absent in [0x4005u16, 0x6001, 0xC002, 0x0001, 0xFFFF] {
            assert_eq!(st.lookup(&absent.to_be_bytes()), None, "{absent:#06x}");
        }

        // Each occupied shard indexes its keys in input order, and the shard
        // table matches a standalone build of the same key list bit for bit.
        let dir = tempfile::tempdir().unwrap();
        for (shard, shard_keys) in expected {
            let got = dir.path().join("got.mph");
            let want = dir.path().join("want.mph");
            let sub = st.tables[*shard].as_ref().expect("occupied shard");
            sub.dump_to_file(&got).unwrap();
            let standalone = Table::build(shard_keys.clone()).unwrap();
            standalone.dump_to_file(&want).unwrap();
            assert_eq!(
                fs::read(&got).unwrap(),
                fs::read(&want).unwrap(),
                "shard {shard} dump differs"
            );
        }
    }

    #[test]
    fn build_full_keys() {
        let st = ShardedTable::build(&corpus(), 3, false, None).unwrap();
        assert!(!st.suffix_only());
        check_sharded(&st, &per_shard_full());
        for (i, key) in corpus().iter().enumerate() {
            // Index within the shard, not within the whole corpus.
            let per_shard_idx = corpus()[..i]
                .iter()
                .filter(|k| k[0] >> 5 == key[0] >> 5)
                .count() as u32;
            assert_eq!(st.lookup(key), Some(per_shard_idx));
        }
    }

    #[test]
    fn build_suffix_keys() {
        let st = ShardedTable::build(&corpus(), 3, true, None).unwrap();
        assert!(st.suffix_only());
        check_sharded(&st, &per_shard_suffixes());
    }

    #[test]
    fn build_parallel_matches_serial() {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(4)
            .build()
            .unwrap();
        let serial = ShardedTable::build(&corpus(), 3, false, None).unwrap();
        let parallel = ShardedTable::build(&corpus(), 3, false, Some(&pool)).unwrap();
        for key in corpus() {
            assert_eq!(serial.lookup(&key), parallel.lookup(&key));
        }
    }

    #[test]
    fn dump_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        for suffix_only in [false, true] {
            let st = ShardedTable::build(&corpus(), 3, suffix_only, None).unwrap();
            let dump = dir.path().join(format!("sharded-{suffix_only}.mph"));
            st.dump_to_file(&dump).unwrap();

            let loaded = ShardedTable::load_from_file(&dump).unwrap();
            assert_eq!(loaded.counts(), st.counts());
            assert_eq!(loaded.pref_bits(), 3);
            assert_eq!(loaded.suffix_only(), suffix_only);
            for key in corpus() {
                assert_eq!(loaded.lookup(&key), st.lookup(&key));
            }
            assert_eq!(loaded.lookup(&0x4005u16.to_be_bytes()), None);
        }
    }

    #[test]
    fn build_rejects_bad_pref_bits() {
        for bits in [0, 33, 64] {
            let err = ShardedTable::build(&corpus(), bits, false, None).unwrap_err();
            assert!(matches!(err, MphError::InvalidArgument(_)), "bits {bits}");
        }
    }

    #[test]
    fn build_rejects_short_keys() {
        let keys = vec![vec![0xAB], vec![]];
        let err = ShardedTable::build(&keys, 3, false, None).unwrap_err();
        assert!(matches!(err, MphError::KeyTooShort { bits: 3 }));
    }

    #[test]
    fn build_duplicate_key_fails_whole_table() {
        let mut keys = corpus();
        keys.push(keys[0].clone());
        let err = ShardedTable::build(&keys, 3, false, None).unwrap_err();
        assert!(matches!(err, MphError::DuplicateKey));
    }

    #[test]
    fn spill_config_validation() {
        let dir = std::env::temp_dir();
        assert!(ShardedBuilder::new(SpillConfig::new(0, 3), &dir).is_err());
        assert!(ShardedBuilder::new(SpillConfig::new(8, 0), &dir).is_err());
        assert!(ShardedBuilder::new(SpillConfig::new(8, 3).with_buf_size(0), &dir).is_err());
        // 9 prefix bits need more than one key byte.
        assert!(ShardedBuilder::new(SpillConfig::new(1, 9), &dir).is_err());
        // Suffix-only with the prefix covering the whole key stores nothing.
        let whole = SpillConfig::new(2, 16).with_suffix_only(true);
        assert!(ShardedBuilder::new(whole, &dir).is_err());
    }

    #[test]
    fn put_rejects_wrong_length() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = ShardedBuilder::new(SpillConfig::new(4, 3), dir.path()).unwrap();
        let err = builder.put(b"abc").unwrap_err();
        assert!(matches!(err, MphError::InvalidArgument(_)));
        builder.put(b"abcd").unwrap();
    }
}
