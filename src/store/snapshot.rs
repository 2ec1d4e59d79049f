use std::collections::{BTreeMap, BTreeSet};

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use rayon::prelude::*;

use crate::core::Digest;
use crate::error::StoreError;
use crate::store::{Directory, DirectoryNode, FileNode, Store, is_contained};

/// A captured tree: its root digest plus the flat lists of paths in it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub digest: Digest,
    pub files: Vec<Utf8PathBuf>,
    pub dirs: Vec<Utf8PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileContent {
    pub path: Utf8PathBuf,
    pub content: Vec<u8>,
    pub is_executable: bool,
}

#[derive(Default)]
struct TreeBuilder {
    files: BTreeMap<String, (Digest, bool)>,
    dirs: BTreeMap<String, TreeBuilder>,
}

impl TreeBuilder {
    fn dir_mut(&mut self, path: &Utf8Path) -> &mut TreeBuilder {
        let mut cursor = self;
        for component in path.components() {
            let Utf8Component::Normal(_) = component else {
                continue;
            };
            cursor = cursor
                .dirs
                .entry(component.as_str().to_string())
                .or_default();
        }
        cursor
    }

    fn record(self, store: &Store) -> Result<Digest, StoreError> {
        let directories = self
            .dirs
            .into_iter()
            .map(|(name, child)| {
                Ok(DirectoryNode {
                    name,
                    digest: child.record(store)?,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        let files = self
            .files
            .into_iter()
            .map(|(name, (digest, is_executable))| FileNode {
                name,
                digest,
                is_executable,
            })
            .collect();

        store.record_directory(&Directory { files, directories })
    }
}

impl Snapshot {
    /// Records the tree made of `files` (relative path, digest, executable
    /// bit) and the possibly empty directories `dirs`. Every path must be
    /// relative and free of `..`.
    pub fn from_entries(
        store: &Store,
        files: Vec<(Utf8PathBuf, Digest, bool)>,
        dirs: Vec<Utf8PathBuf>,
    ) -> Result<Snapshot, StoreError> {
        let mut paths = files.iter().map(|(path, _, _)| path).chain(&dirs);
        if let Some(path) = paths.find(|path| !is_contained(path)) {
            return Err(StoreError::OutsideRoot(path.to_string()));
        }

        let mut tree = TreeBuilder::default();
        let mut all_dirs: Vec<Utf8PathBuf> = dirs.clone();

        for dir in &dirs {
            tree.dir_mut(dir);
        }
        for (path, digest, is_executable) in &files {
            let parent = path.parent().unwrap_or(Utf8Path::new(""));
            let Some(name) = path.file_name() else {
                continue;
            };
            tree.dir_mut(parent)
                .files
                .insert(name.to_string(), (*digest, *is_executable));
            all_dirs.extend(parent.ancestors().filter(|a| !a.as_str().is_empty()).map(Utf8Path::to_owned));
        }

        let digest = tree.record(store)?;

        let mut files: Vec<Utf8PathBuf> = files.into_iter().map(|(path, _, _)| path).collect();
        files.sort();
        files.dedup();
        all_dirs.sort();
        all_dirs.dedup();

        Ok(Snapshot {
            digest,
            files,
            dirs: all_dirs,
        })
    }

    /// Unions the trees `digests`. A path may appear in several of them only
    /// with the same content.
    pub fn merge(store: &Store, digests: &[Digest]) -> Result<Snapshot, StoreError> {
        let mut entries = Entries::default();
        for digest in digests {
            let mut conflict = None;
            walk(store, *digest, Utf8Path::new(""), &mut |path, node| {
                if conflict.is_some() {
                    return;
                }
                let outcome = match node {
                    Entry::File(file) => entries.file(path, file.digest, file.is_executable),
                    Entry::Dir => entries.dir(path),
                };
                conflict = outcome.err();
            })?;
            if let Some(err) = conflict {
                return Err(err);
            }
        }
        entries.record(store)
    }

    /// Stores `files` and records them, along with the empty directories
    /// `dirs`, as one tree.
    pub fn create(store: &Store, files: &[FileContent], dirs: Vec<Utf8PathBuf>) -> Result<Snapshot, StoreError> {
        let stored = files
            .par_iter()
            .map(|file| Ok((file.path.clone(), store.store_bytes(&file.content)?, file.is_executable)))
            .collect::<Result<Vec<_>, StoreError>>()?;

        let mut entries = Entries::default();
        for (path, digest, is_executable) in stored {
            entries.file(path, digest, is_executable)?;
        }
        for dir in dirs {
            entries.dir(dir)?;
        }
        entries.record(store)
    }

    /// Hashes `files` under `root` in parallel and records them.
    pub fn capture(
        store: &Store,
        root: &Utf8Path,
        files: &[Utf8PathBuf],
        dirs: Vec<Utf8PathBuf>,
    ) -> Result<Snapshot, StoreError> {
        let entries = files
            .par_iter()
            .map(|path| {
                let absolute = root.join(path);
                let digest = store.store_file(&absolute)?;
                Ok((path.clone(), digest, is_executable(&absolute)))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        Snapshot::from_entries(store, entries, dirs)
    }

    /// Lists the tree recorded under `digest`.
    pub fn from_digest(store: &Store, digest: Digest) -> Result<Snapshot, StoreError> {
        let mut files = Vec::new();
        let mut dirs = Vec::new();
        walk(store, digest, Utf8Path::new(""), &mut |path, node| match node {
            Entry::File(_) => files.push(path),
            Entry::Dir => dirs.push(path),
        })?;
        files.sort();
        dirs.sort();
        Ok(Snapshot {
            digest,
            files,
            dirs,
        })
    }

    /// Loads every file in the tree `digest`.
    pub fn contents(store: &Store, digest: Digest) -> Result<Vec<FileContent>, StoreError> {
        let mut nodes = Vec::new();
        walk(store, digest, Utf8Path::new(""), &mut |path, node| {
            if let Entry::File(file) = node {
                nodes.push((path, file.digest, file.is_executable));
            }
        })?;

        let mut out = nodes
            .into_par_iter()
            .map(|(path, digest, is_executable)| {
                Ok(FileContent {
                    path,
                    content: store.load_bytes(digest)?,
                    is_executable,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }
}

/// Paths gathered for a new tree, checked for clashes as they arrive.
#[derive(Default)]
struct Entries {
    files: BTreeMap<Utf8PathBuf, (Digest, bool)>,
    dirs: BTreeSet<Utf8PathBuf>,
}

impl Entries {
    fn file(&mut self, path: Utf8PathBuf, digest: Digest, is_executable: bool) -> Result<(), StoreError> {
        let clash = self.dirs.contains(&path)
            || self
                .files
                .get(&path)
                .is_some_and(|existing| *existing != (digest, is_executable));
        if clash {
            return Err(StoreError::MergeConflict(path.into_string()));
        }
        self.files.insert(path, (digest, is_executable));
        Ok(())
    }

    fn dir(&mut self, path: Utf8PathBuf) -> Result<(), StoreError> {
        if self.files.contains_key(&path) {
            return Err(StoreError::MergeConflict(path.into_string()));
        }
        self.dirs.insert(path);
        Ok(())
    }

    fn record(self, store: &Store) -> Result<Snapshot, StoreError> {
        // A file can't also be the parent of another entry.
        for path in self.files.keys().chain(&self.dirs) {
            let clash = path
                .ancestors()
                .skip(1)
                .find(|parent| self.files.contains_key(*parent));
            if let Some(parent) = clash {
                return Err(StoreError::MergeConflict(parent.to_string()));
            }
        }

        let files = self
            .files
            .into_iter()
            .map(|(path, (digest, is_executable))| (path, digest, is_executable))
            .collect();
        Snapshot::from_entries(store, files, self.dirs.into_iter().collect())
    }
}

enum Entry<'a> {
    File(&'a FileNode),
    Dir,
}

fn walk(
    store: &Store,
    digest: Digest,
    prefix: &Utf8Path,
    f: &mut dyn FnMut(Utf8PathBuf, Entry<'_>),
) -> Result<(), StoreError> {
    let directory = store.load_directory(digest)?;
    for file in &directory.files {
        f(prefix.join(&file.name), Entry::File(file));
    }
    for child in &directory.directories {
        let path = prefix.join(&child.name);
        f(path.clone(), Entry::Dir);
        walk(store, child.digest, &path, f)?;
    }
    Ok(())
}

#[cfg(unix)]
pub(crate) fn is_executable(path: &Utf8Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub(crate) fn is_executable(_: &Utf8Path) -> bool {
    false
}
