//! Key corpora backing a table: an owned in-memory corpus, or a keys file of
//! fixed-stride records read by offset.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::error::MphError;

const SCAN_BUF: usize = 1 << 20;

#[derive(Debug)]
pub(crate) enum KeyStore {
    Mem(Vec<Vec<u8>>),
    File(FileKeys),
}

impl KeyStore {
    pub fn num_keys(&self) -> u64 {
        match self {
            KeyStore::Mem(keys) => keys.len() as u64,
            KeyStore::File(fk) => fk.num_keys,
        }
    }

    pub fn heap_bytes(&self) -> usize {
        match self {
            KeyStore::Mem(keys) => keys.iter().map(|k| k.len()).sum(),
            KeyStore::File(_) => 0,
        }
    }
}

/// An open keys file: `num_keys` records of `key_len` bytes each, starting at
/// offset 0. The handle is owned by the table and only ever read positionally,
/// so concurrent lookups share it without locking.
#[derive(Debug)]
pub(crate) struct FileKeys {
    file: File,
    path: PathBuf,
    key_len: usize,
    num_keys: u64,
}

impl FileKeys {
    /// Opens a file that contains nothing but key records. The record count
    /// is derived from the file size, which must divide evenly.
    pub fn open(path: &Path, key_len: usize) -> Result<Self, MphError> {
        if key_len == 0 {
            return Err(MphError::InvalidArgument("key length must be >= 1".into()));
        }
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if file_len % key_len as u64 != 0 {
            return Err(MphError::MalformedInput(format!(
                "keys file length ({file_len}) is not a multiple of key length ({key_len})"
            )));
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
            key_len,
            num_keys: file_len / key_len as u64,
        })
    }

    /// Opens a file whose key region is followed by other data (a co-located
    /// table dump), so the record count comes from the caller, not the size.
    pub fn open_prefix(path: &Path, key_len: usize, num_keys: u64) -> Result<Self, MphError> {
        if key_len == 0 {
            return Err(MphError::InvalidArgument("key length must be >= 1".into()));
        }
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if num_keys * key_len as u64 > file_len {
            return Err(MphError::MalformedInput(format!(
                "keys file shorter than {num_keys} records of {key_len} bytes"
            )));
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
            key_len,
            num_keys,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key_len(&self) -> usize {
        self.key_len
    }

    pub fn num_keys(&self) -> u64 {
        self.num_keys
    }

    /// Sequential pass over all records in index order.
    pub fn scan<F>(&self, mut f: F) -> Result<(), MphError>
    where
        F: FnMut(u32, &[u8]),
    {
        let mut reader = BufReader::with_capacity(SCAN_BUF, &self.file);
        reader.seek(SeekFrom::Start(0))?;
        let mut key = vec![0u8; self.key_len];
        for i in 0..self.num_keys {
            reader.read_exact(&mut key)?;
            f(i as u32, &key);
        }
        Ok(())
    }

    /// Positional read of record `idx`.
    pub fn key_at(&self, idx: u64) -> io::Result<Vec<u8>> {
        let mut key = vec![0u8; self.key_len];
        self.file
            .read_exact_at(&mut key, idx * self.key_len as u64)?;
        Ok(key)
    }
}
