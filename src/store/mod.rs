//! Local content-addressed store.
//!
//! Blobs live under `files/<hex>`, directory records (CBOR) under
//! `directories/<hex>`, and process cache records under `cache/<hex>`.
//! Content is protected from [`Store::garbage_collect`] by leases, which are
//! persisted to `leases.cbor`. Every write leases what it wrote, so content
//! produced by a running node survives a collection that happens before the
//! node completes.

mod snapshot;

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::core::{Digest, EMPTY_DIGEST, Hash32};
use crate::error::StoreError;

pub use self::snapshot::{FileContent, Snapshot};
pub(crate) use self::snapshot::is_executable;

const DIR_FILES: &str = "files";
const DIR_DIRECTORIES: &str = "directories";
const DIR_CACHE: &str = "cache";
const FILE_LEASES: &str = "leases.cbor";

/// How long content stays protected after a lease.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    pub digest: Digest,
    pub is_executable: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryNode {
    pub name: String,
    pub digest: Digest,
}

/// One level of a directory tree. Children are kept sorted by name, so equal
/// trees always encode to the same bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    pub files: Vec<FileNode>,
    pub directories: Vec<DirectoryNode>,
}

impl Directory {
    fn is_empty(&self) -> bool {
        self.files.is_empty() && self.directories.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Blobs and directories.
    pub removed: usize,
    pub freed_bytes: u64,
    /// Cache records that referred to removed content.
    pub stale_records: usize,
}

/// A cache record along with the content it refers to.
#[derive(Serialize, Deserialize)]
struct CacheEnvelope<T> {
    refs: Vec<Digest>,
    record: T,
}

struct Inner {
    root: Utf8PathBuf,
    /// Hash -> lease expiry, in seconds since the epoch.
    leases: Mutex<HashMap<Hash32, u64>>,
    write_lease: Duration,
}

#[derive(Clone)]
pub struct Store(Arc<Inner>);

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// A single normal path component: not empty, not `.` or `..`, no
/// separator.
pub(crate) fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

/// A relative path that stays below the directory it is joined to.
pub(crate) fn is_contained(path: &Utf8Path) -> bool {
    path.components().all(|c| matches!(c, Utf8Component::Normal(_) | Utf8Component::CurDir))
}

impl Store {
    pub fn open(root: impl Into<Utf8PathBuf>) -> Result<Self, StoreError> {
        Self::open_with_write_lease(root, DEFAULT_LEASE)
    }

    /// Opens the store with writes leased for `write_lease`. A zero lease
    /// leaves new content unprotected until [`Store::lease_all`].
    pub fn open_with_write_lease(root: impl Into<Utf8PathBuf>, write_lease: Duration) -> Result<Self, StoreError> {
        let root = root.into();
        for dir in [DIR_FILES, DIR_DIRECTORIES, DIR_CACHE] {
            fs::create_dir_all(root.join(dir))?;
        }

        let leases_path = root.join(FILE_LEASES);
        let leases: HashMap<Hash32, u64> = if leases_path.exists() {
            let file = BufReader::new(File::open(&leases_path)?);
            let records: Vec<(Hash32, u64)> = ciborium::from_reader(file)?;
            records.into_iter().collect()
        } else {
            HashMap::new()
        };

        tracing::debug!(root = %root, leases = leases.len(), "Opened store");

        Ok(Store(Arc::new(Inner {
            root,
            leases: Mutex::new(leases),
            write_lease,
        })))
    }

    pub fn root(&self) -> &Utf8Path {
        &self.0.root
    }

    fn file_path(&self, hash: &Hash32) -> Utf8PathBuf {
        self.0.root.join(DIR_FILES).join(hash.to_hex())
    }

    fn directory_path(&self, hash: &Hash32) -> Utf8PathBuf {
        self.0.root.join(DIR_DIRECTORIES).join(hash.to_hex())
    }

    fn cache_path(&self, key: &Hash32) -> Utf8PathBuf {
        self.0.root.join(DIR_CACHE).join(format!("{}.cbor", key.to_hex()))
    }

    /// Writes `bytes` to `path` through a temporary file in the same
    /// directory, so readers never see a partial blob.
    fn write_atomic(path: &Utf8Path, bytes: &[u8]) -> Result<(), StoreError> {
        let dir = path.parent().unwrap_or(Utf8Path::new("."));
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        temp.write_all(bytes)?;
        temp.persist(path).map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }

    fn lease_written(&self, hash: Hash32) {
        if self.0.write_lease.is_zero() {
            return;
        }
        let until = now_secs() + self.0.write_lease.as_secs();
        let mut leases = self.0.leases.lock();
        let entry = leases.entry(hash).or_default();
        *entry = (*entry).max(until);
    }

    pub fn store_bytes(&self, bytes: &[u8]) -> Result<Digest, StoreError> {
        let digest = Digest::of_bytes(bytes);
        let path = self.file_path(&digest.hash);
        if !path.exists() {
            Self::write_atomic(&path, bytes)?;
        }
        self.lease_written(digest.hash);
        Ok(digest)
    }

    /// Hashes a file on disk and copies it into the store.
    pub fn store_file(&self, source: &Utf8Path) -> Result<Digest, StoreError> {
        let hash = Hash32::hash_file(source)?;
        let size_bytes = fs::metadata(source)?.len() as usize;
        let path = self.file_path(&hash);
        if !path.exists() {
            let dir = path.parent().unwrap_or(Utf8Path::new("."));
            let temp = tempfile::NamedTempFile::new_in(dir)?;
            fs::copy(source, temp.path())?;
            temp.persist(&path).map_err(|e| StoreError::Io(e.error))?;
        }
        self.lease_written(hash);
        Ok(Digest { hash, size_bytes })
    }

    pub fn load_bytes(&self, digest: Digest) -> Result<Vec<u8>, StoreError> {
        if digest == *EMPTY_DIGEST {
            return Ok(Vec::new());
        }
        fs::read(self.file_path(&digest.hash)).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => StoreError::Missing {
                kind: "file",
                digest,
            },
            _ => StoreError::Io(err),
        })
    }

    pub fn record_directory(&self, directory: &Directory) -> Result<Digest, StoreError> {
        if directory.is_empty() {
            return Ok(*EMPTY_DIGEST);
        }
        let mut bytes = Vec::new();
        ciborium::into_writer(directory, &mut bytes)?;
        let digest = Digest::of_bytes(&bytes);
        let path = self.directory_path(&digest.hash);
        if !path.exists() {
            Self::write_atomic(&path, &bytes)?;
        }
        self.lease_written(digest.hash);
        Ok(digest)
    }

    pub fn load_directory(&self, digest: Digest) -> Result<Directory, StoreError> {
        if digest == *EMPTY_DIGEST {
            return Ok(Directory::default());
        }
        let path = self.directory_path(&digest.hash);
        let file = File::open(&path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => StoreError::Missing {
                kind: "directory",
                digest,
            },
            _ => StoreError::Io(err),
        })?;
        Ok(ciborium::from_reader(BufReader::new(file))?)
    }

    /// Whether a blob or a directory with this digest is present.
    pub fn contains(&self, digest: Digest) -> bool {
        digest == *EMPTY_DIGEST
            || self.file_path(&digest.hash).exists()
            || self.directory_path(&digest.hash).exists()
    }

    /// Writes the tree `digest` under `dest`.
    pub fn materialize(&self, digest: Digest, dest: &Utf8Path) -> Result<(), StoreError> {
        let directory = self.load_directory(digest)?;
        fs::create_dir_all(dest)?;

        for name in directory
            .files
            .iter()
            .map(|f| &f.name)
            .chain(directory.directories.iter().map(|d| &d.name))
        {
            if !is_plain_name(name) {
                return Err(StoreError::OutsideRoot(name.clone()));
            }
        }

        directory.files.par_iter().try_for_each(|file| {
            let target = dest.join(&file.name);
            let source = self.file_path(&file.digest.hash);
            if file.digest == *EMPTY_DIGEST {
                File::create(&target)?;
            } else if fs::hard_link(&source, &target).is_err() {
                // hard link with fallback to copy
                fs::copy(&source, &target)?;
            }
            #[cfg(unix)]
            if file.is_executable {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&target, fs::Permissions::from_mode(0o755))?;
            }
            Ok::<_, StoreError>(())
        })?;

        for child in &directory.directories {
            self.materialize(child.digest, &dest.join(&child.name))?;
        }
        Ok(())
    }

    /// Every blob and directory digest reachable from `digest`.
    fn expand(&self, digest: Digest, out: &mut Vec<Hash32>) -> Result<(), StoreError> {
        out.push(digest.hash);
        if self.directory_path(&digest.hash).exists() {
            let directory = self.load_directory(digest)?;
            out.extend(directory.files.iter().map(|f| f.digest.hash));
            for child in &directory.directories {
                self.expand(child.digest, out)?;
            }
        }
        Ok(())
    }

    /// Protects `digests` (and, for directories, everything below them) from
    /// garbage collection for `lease`.
    pub fn lease_all(
        &self,
        digests: impl IntoIterator<Item = Digest>,
        lease: Duration,
    ) -> Result<usize, StoreError> {
        let mut hashes = Vec::new();
        for digest in digests {
            self.expand(digest, &mut hashes)?;
        }

        let until = now_secs() + lease.as_secs();
        let count = {
            let mut leases = self.0.leases.lock();
            for hash in &hashes {
                leases.insert(*hash, until);
            }
            leases.len()
        };
        self.persist_leases()?;

        tracing::debug!(leased = hashes.len(), total = count, "Leased store content");
        Ok(hashes.len())
    }

    fn persist_leases(&self) -> Result<(), StoreError> {
        let records: Vec<(Hash32, u64)> = self
            .0
            .leases
            .lock()
            .iter()
            .map(|(hash, until)| (*hash, *until))
            .collect();
        let mut bytes = Vec::new();
        ciborium::into_writer(&records, &mut bytes)?;
        Self::write_atomic(&self.0.root.join(FILE_LEASES), &bytes)
    }

    /// Removes every blob and directory without a live lease.
    pub fn garbage_collect(&self) -> Result<GcStats, StoreError> {
        let now = now_secs();
        let live: HashMap<Hash32, u64> = {
            let mut leases = self.0.leases.lock();
            leases.retain(|_, until| *until > now);
            leases.clone()
        };

        let mut candidates = Vec::new();
        for dir in [DIR_FILES, DIR_DIRECTORIES] {
            for entry in fs::read_dir(self.0.root.join(dir))? {
                let path = Utf8PathBuf::try_from(entry?.path())?;
                let leased = path
                    .file_name()
                    .and_then(|name| name.parse::<Hash32>().ok())
                    .is_some_and(|hash| live.contains_key(&hash));
                if !leased {
                    candidates.push(path);
                }
            }
        }

        let freed: Vec<u64> = candidates
            .par_iter()
            .filter_map(|path| {
                let size = fs::metadata(path).map(|m| m.len()).unwrap_or_default();
                fs::remove_file(path).ok().map(|_| size)
            })
            .collect();

        self.persist_leases()?;
        let stale_records = self.collect_cache()?;

        let stats = GcStats {
            removed: freed.len(),
            freed_bytes: freed.iter().sum(),
            stale_records,
        };
        tracing::info!(
            removed = stats.removed,
            freed_bytes = stats.freed_bytes,
            stale_records,
            "Collected store garbage"
        );
        Ok(stats)
    }

    /// Drops cache records that are unreadable or refer to missing content.
    fn collect_cache(&self) -> Result<usize, StoreError> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(self.0.root.join(DIR_CACHE))? {
            let path = Utf8PathBuf::try_from(entry?.path())?;
            if path.extension() == Some("cbor") {
                paths.push(path);
            }
        }

        let removed = paths
            .par_iter()
            .filter(|path| {
                let envelope = File::open(path).ok().and_then(|file| {
                    ciborium::from_reader::<CacheEnvelope<ciborium::value::Value>, _>(BufReader::new(file)).ok()
                });
                let live = envelope.is_some_and(|e| e.refs.iter().all(|digest| self.contains(*digest)));
                !live && fs::remove_file(path).is_ok()
            })
            .count();
        Ok(removed)
    }

    pub fn load_cache<T: DeserializeOwned>(&self, key: Hash32) -> Result<Option<T>, StoreError> {
        let path = self.cache_path(&key);
        if !path.exists() {
            return Ok(None);
        }
        let file = BufReader::new(File::open(&path)?);
        let envelope: Option<CacheEnvelope<T>> = ciborium::from_reader(file).ok();
        Ok(envelope.map(|e| e.record))
    }

    /// Records `record` under `key`. The record is dropped by the first
    /// collection that removes any of `refs`.
    pub fn store_cache<T: Serialize>(&self, key: Hash32, record: &T, refs: &[Digest]) -> Result<(), StoreError> {
        let path = self.cache_path(&key);
        let dir = path.parent().unwrap_or(Utf8Path::new("."));
        let temp = tempfile::NamedTempFile::new_in(dir)?;
        {
            let envelope = CacheEnvelope {
                refs: refs.to_vec(),
                record,
            };
            let mut writer = BufWriter::new(temp.as_file());
            ciborium::into_writer(&envelope, &mut writer)?;
            writer.flush()?;
        }
        temp.persist(&path).map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }
}
