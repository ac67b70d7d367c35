use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::cache::{Cache, CacheError, Metadata};

const FILE_INFO: &str = "info.json";
const FILE_BLOB: &str = "blob.bin";

/// Record stored as the archive's first member.
#[derive(Debug, Serialize, Deserialize)]
struct Info {
    key: String,
    metadata: Metadata,
}

/// Size-bounded blob store. Every entry is a zip archive (STORE method) of
/// `info.json` + `blob.bin`, named after the SHA-256 of its key. A single
/// mutex guards the directory for reads (the access time is refreshed
/// inline), deletions and the accept+evict step of writes; the body write
/// itself goes to a temp file outside the lock.
pub struct DiskCache {
    dir: PathBuf,
    limit_bytes: u64,
    mtx: Mutex<()>,
}

impl DiskCache {
    pub fn new(dir: impl Into<PathBuf>, limit_bytes: u64) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).with_context(|| format!("create cache dir {}", dir.display()))?;

        Ok(Self {
            dir,
            limit_bytes,
            mtx: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // The maximum filename length is 255 bytes on the usual filesystems, and
    // keys contain slashes; hashing erases both hazards.
    fn path(&self, key: &str) -> PathBuf {
        let hash = Sha256::digest(key.as_bytes());
        self.dir.join(hex::encode(hash))
    }

    fn get_sync(&self, key: &str) -> Result<(Bytes, Metadata), CacheError> {
        let _guard = self.mtx.lock().expect("cache mutex");

        let path = self.path(key);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Err(CacheError::NotFound),
            Err(err) => {
                return Err(CacheError::Other(anyhow!("failed to open cache entry {key:?}: {err}")));
            }
        };

        // Refresh the modification time so that eviction keeps recently-used
        // entries alive.
        file.set_modified(SystemTime::now())
            .with_context(|| format!("failed to refresh times for cache entry {key:?}"))?;

        let mut archive =
            ZipArchive::new(file).with_context(|| format!("failed to open cache entry {key:?} as a zip file"))?;

        let info: Info = {
            let member = archive
                .by_name(FILE_INFO)
                .with_context(|| format!("failed to read {FILE_INFO} from cache entry {key:?}"))?;
            serde_json::from_reader(member)
                .with_context(|| format!("failed to decode {FILE_INFO} of cache entry {key:?}"))?
        };

        let mut blob = Vec::new();
        archive
            .by_name(FILE_BLOB)
            .with_context(|| format!("failed to read {FILE_BLOB} from cache entry {key:?}"))?
            .read_to_end(&mut blob)
            .with_context(|| format!("failed to read {FILE_BLOB} of cache entry {key:?}"))?;

        Ok((Bytes::from(blob), info.metadata))
    }

    fn put_sync(&self, key: &str, metadata: Metadata, blob: &[u8]) -> Result<(), CacheError> {
        // Temp files live in the cache dir so the final rename stays on one
        // filesystem; their names never look like entry hashes, so the
        // eviction scan ignores them.
        let tmp = tempfile::Builder::new()
            .prefix(".chacha-put-")
            .tempfile_in(&self.dir)
            .with_context(|| format!("failed to create a temporary file for cache entry {key:?}"))?;

        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

        let mut writer = ZipWriter::new(tmp.as_file());

        let info = Info {
            key: key.to_string(),
            metadata,
        };
        let info_bytes = serde_json::to_vec(&info)
            .with_context(|| format!("failed to encode {FILE_INFO} for cache entry {key:?}"))?;
        writer
            .start_file(FILE_INFO, options)
            .with_context(|| format!("failed to write {FILE_INFO} to cache entry {key:?}"))?;
        writer
            .write_all(&info_bytes)
            .with_context(|| format!("failed to write {FILE_INFO} to cache entry {key:?}"))?;

        writer
            .start_file(FILE_BLOB, options.large_file(blob.len() as u64 > u32::MAX as u64))
            .with_context(|| format!("failed to write {FILE_BLOB} to cache entry {key:?}"))?;
        writer
            .write_all(blob)
            .with_context(|| format!("failed to write {FILE_BLOB} to cache entry {key:?}"))?;
        writer
            .finish()
            .with_context(|| format!("failed to finalize cache entry {key:?}"))?;

        self.accept(key, tmp)
            .with_context(|| format!("failed to accept cache entry {key:?}"))?;

        Ok(())
    }

    fn accept(&self, key: &str, tmp: tempfile::NamedTempFile) -> Result<()> {
        let _guard = self.mtx.lock().expect("cache mutex");

        let size = tmp.as_file().metadata().context("stat temp file")?.len();
        self.evict(size)?;

        tmp.persist(self.path(key)).context("rename into cache dir")?;
        Ok(())
    }

    fn evict(&self, need_bytes: u64) -> Result<()> {
        if need_bytes > self.limit_bytes {
            return Err(anyhow!(
                "cannot accept cache entry as its size of {need_bytes} bytes \
                 is larger than the disk limit of {} bytes",
                self.limit_bytes
            ));
        }

        struct Entry {
            path: PathBuf,
            size: u64,
            mtime: SystemTime,
        }

        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(&self.dir).context("read cache dir")? {
            let dir_entry = dir_entry.context("read cache dir entry")?;
            if !is_entry_name(&dir_entry.file_name().to_string_lossy()) {
                continue;
            }
            let meta = dir_entry.metadata().context("stat cache entry")?;
            entries.push(Entry {
                path: dir_entry.path(),
                size: meta.len(),
                mtime: meta.modified().context("cache entry mtime")?,
            });
        }

        entries.sort_by_key(|entry| entry.mtime);

        let mut used_bytes: u64 = entries.iter().map(|entry| entry.size).sum();

        // Evict the oldest entries until the new one fits.
        for entry in entries {
            if used_bytes + need_bytes <= self.limit_bytes {
                return Ok(());
            }

            fs::remove_file(&entry.path)
                .with_context(|| format!("evict cache entry {}", entry.path.display()))?;
            used_bytes -= entry.size;
        }

        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<(), CacheError> {
        let _guard = self.mtx.lock().expect("cache mutex");

        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(CacheError::NotFound),
            Err(err) => Err(CacheError::Other(anyhow!("failed to delete cache entry {key:?}: {err}"))),
        }
    }
}

fn is_entry_name(name: &str) -> bool {
    name.len() == 64 && name.bytes().all(|c| c.is_ascii_hexdigit())
}

#[async_trait]
impl Cache for DiskCache {
    async fn get(&self, key: &str) -> Result<(Bytes, Metadata), CacheError> {
        self.get_sync(key)
    }

    async fn put(&self, key: &str, metadata: Metadata, blob: Bytes) -> Result<(), CacheError> {
        self.put_sync(key, metadata, &blob)
    }
}
