use std::collections::BTreeSet;
use std::fmt;
use std::io::ErrorKind;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use futures::future::try_join_all;
use glob::{MatchOptions, Pattern};

use super::{NodeKey, NodeOutput, blocking};
use crate::context::{Context, Core};
use crate::core::{Digest, Hash32};
use crate::error::Failure;
use crate::host::Value;
use crate::store::{FileContent, Snapshot, is_executable};
use crate::tasks::FsTypes;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Glob patterns relative to the build root.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct PathGlobs {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl fmt::Display for PathGlobs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.include.join(", "))?;
        if !self.exclude.is_empty() {
            write!(f, " !{}", self.exclude.join(", !"))?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
}

fn read_dir(core: &Core, dir: &Utf8Path) -> std::io::Result<Vec<DirEntry>> {
    let entries = match std::fs::read_dir(core.build_root.join(dir)) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let mut out = Vec::new();
    for entry in entries {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if core.is_ignored(&dir.join(&name)) {
            continue;
        }
        // Symlinks are followed.
        let kind = match std::fs::metadata(entry.path()) {
            Ok(meta) if meta.is_dir() => EntryKind::Dir,
            Ok(meta) if meta.is_file() => EntryKind::File,
            _ => continue,
        };
        out.push(DirEntry { name, kind });
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

pub(super) async fn scandir(context: &Context, dir: Utf8PathBuf) -> Result<NodeOutput, Failure> {
    let core = context.core.clone();
    let listing = blocking(context, move || read_dir(&core, &dir)).await?;
    Ok(NodeOutput::Listing(Arc::new(listing)))
}

pub(super) async fn digest_file(context: &Context, path: Utf8PathBuf) -> Result<NodeOutput, Failure> {
    let store = context.core.store.clone();
    let absolute = context.core.build_root.join(&path);
    let (digest, is_executable) = blocking(context, move || {
        store
            .store_file(&absolute)
            .map(|digest| (digest, is_executable(&absolute)))
    })
    .await?;
    Ok(NodeOutput::File {
        digest,
        is_executable,
    })
}

/// Splits a glob into its literal directory prefix and the number of
/// directory levels below it that can match, `None` for `**`.
fn split_glob(glob: &str) -> (Utf8PathBuf, Option<usize>) {
    let components: Vec<&str> = glob.split('/').filter(|c| !c.is_empty() && *c != ".").collect();
    let wildcard = components
        .iter()
        .position(|c| c.contains(['*', '?', '[']))
        .unwrap_or(components.len().saturating_sub(1));

    let prefix: Utf8PathBuf = components[..wildcard].iter().collect();
    let rest = &components[wildcard..];
    let depth = if rest.contains(&"**") { None } else { Some(rest.len()) };
    (prefix, depth)
}

fn compile(context: &Context, globs: &[String]) -> Result<Vec<Pattern>, Failure> {
    globs
        .iter()
        .map(|glob| {
            if glob.starts_with('/') || glob.split('/').any(|c| c == "..") {
                return Err(context.throw(format!("Glob '{glob}' escapes the build root")));
            }
            Pattern::new(glob.trim_start_matches("./"))
                .map_err(|err| context.throw(format!("Invalid glob '{glob}': {err}")))
        })
        .collect()
}

/// Walks the directories a single glob can reach, level by level, and
/// collects the matching files.
async fn walk(
    context: &Context,
    glob: &str,
    pattern: &Pattern,
    exclude: &[Pattern],
    out: &mut BTreeSet<Utf8PathBuf>,
) -> Result<(), Failure> {
    let excluded = |path: &Utf8Path| {
        exclude
            .iter()
            .any(|p| p.matches_path_with(path.as_std_path(), MATCH_OPTIONS))
    };

    let (prefix, mut depth) = split_glob(glob);
    let mut level = vec![prefix];

    while !level.is_empty() {
        let listings = try_join_all(
            level
                .iter()
                .map(|dir| context.get(NodeKey::Scandir(dir.clone()))),
        )
        .await?;

        let descend = depth.is_none_or(|d| d > 1);
        let mut next = Vec::new();
        for (dir, listing) in level.iter().zip(listings) {
            let NodeOutput::Listing(entries) = listing else {
                return Err(listing.mismatch("listing"));
            };
            for entry in entries.iter() {
                let path = dir.join(&entry.name);
                if excluded(&path) {
                    continue;
                }
                match entry.kind {
                    EntryKind::File => {
                        if pattern.matches_path_with(path.as_std_path(), MATCH_OPTIONS) {
                            out.insert(path);
                        }
                    }
                    EntryKind::Dir if descend => next.push(path),
                    EntryKind::Dir => {}
                }
            }
        }

        level = next;
        depth = depth.map(|d| d.saturating_sub(1));
    }

    Ok(())
}

pub(super) async fn snapshot(context: &Context, globs: &PathGlobs) -> Result<NodeOutput, Failure> {
    let include = compile(context, &globs.include)?;
    let exclude = compile(context, &globs.exclude)?;

    let mut files = BTreeSet::new();
    for (glob, pattern) in globs.include.iter().zip(&include) {
        walk(context, glob, pattern, &exclude, &mut files).await?;
    }

    let digests = try_join_all(
        files
            .iter()
            .map(|path| context.get(NodeKey::DigestFile(path.clone()))),
    )
    .await?;

    let mut entries = Vec::with_capacity(files.len());
    for (path, output) in files.into_iter().zip(digests) {
        let NodeOutput::File {
            digest,
            is_executable,
        } = output
        else {
            return Err(output.mismatch("file"));
        };
        entries.push((path, digest, is_executable));
    }

    let store = context.core.store.clone();
    let snapshot = blocking(context, move || Snapshot::from_entries(&store, entries, vec![])).await?;
    tracing::debug!(globs = %globs, files = snapshot.files.len(), digest = %snapshot.digest, "Captured snapshot");
    Ok(NodeOutput::Snapshot(Arc::new(snapshot)))
}

fn fs_types(context: &Context) -> Result<&FsTypes, Failure> {
    context
        .core
        .families
        .fs
        .as_ref()
        .ok_or_else(|| Failure::Broke("Filesystem types are not configured".to_string()))
}

pub(super) fn parse_path_globs(context: &Context, value: &Value) -> PathGlobs {
    let externs = &context.core.externs;
    PathGlobs {
        include: externs.project_multi_strs(value, "include"),
        exclude: externs.project_multi_strs(value, "exclude"),
    }
}

/// Expands a host `PathGlobs` value into a snapshot.
pub(super) async fn expand(context: &Context, value: &Value) -> Result<Arc<Snapshot>, Failure> {
    let globs = parse_path_globs(context, value);
    let output = context.get(NodeKey::Snapshot(Arc::new(globs))).await?;
    match output {
        NodeOutput::Snapshot(snapshot) => Ok(snapshot),
        other => Err(other.mismatch("snapshot")),
    }
}

pub(super) fn parse_digest(context: &Context, value: &Value) -> Result<Digest, Failure> {
    let externs = &context.core.externs;
    let fingerprint = externs.project_str(value, "fingerprint");
    let hash: Hash32 = fingerprint
        .parse()
        .map_err(|err| context.throw(format!("Invalid digest fingerprint: {err}")))?;
    let size = externs.project_i64(value, "serialized_bytes_length");
    let size_bytes = usize::try_from(size)
        .map_err(|_| context.throw(format!("Invalid digest length {size}")))?;
    Ok(Digest { hash, size_bytes })
}

/// The files and empty directories a digest is to be created from.
pub(super) fn parse_create_digest(context: &Context, value: &Value) -> (Vec<FileContent>, Vec<Utf8PathBuf>) {
    let externs = &context.core.externs;
    let files = externs
        .project_multi(value, "files")
        .iter()
        .map(|file| FileContent {
            path: externs.project_str(file, "path").into(),
            content: externs.project_bytes(file, "content"),
            is_executable: externs.project_bool(file, "is_executable"),
        })
        .collect();
    let dirs = externs
        .project_multi_strs(value, "directories")
        .into_iter()
        .map(Utf8PathBuf::from)
        .collect();
    (files, dirs)
}

pub(super) fn digest_value(context: &Context, digest: Digest) -> Result<Value, Failure> {
    let fs = fs_types(context)?;
    let externs = &context.core.externs;
    let args = [
        externs.store_utf8(&digest.hash.to_hex()),
        externs.store_i64(digest.size_bytes as i64),
    ];
    context.construct(&fs.construct_directory_digest, &args)
}

fn path_tuple(context: &Context, paths: &[Utf8PathBuf]) -> Value {
    let externs = &context.core.externs;
    let items: Vec<Value> = paths.iter().map(|p| externs.store_utf8(p.as_str())).collect();
    externs.store_tuple(&items)
}

pub(super) fn snapshot_value(context: &Context, snapshot: &Snapshot) -> Result<Value, Failure> {
    let fs = fs_types(context)?;
    let args = [
        digest_value(context, snapshot.digest)?,
        path_tuple(context, &snapshot.files),
        path_tuple(context, &snapshot.dirs),
    ];
    context.construct(&fs.construct_snapshot, &args)
}

pub(super) fn files_content_value(context: &Context, contents: &[FileContent]) -> Result<Value, Failure> {
    let fs = fs_types(context)?;
    let externs = &context.core.externs;
    let files = contents
        .iter()
        .map(|file| {
            let args = [
                externs.store_utf8(file.path.as_str()),
                externs.store_bytes(&file.content),
                externs.store_bool(file.is_executable),
            ];
            context.construct(&fs.construct_file_content, &args)
        })
        .collect::<Result<Vec<_>, _>>()?;
    context.construct(&fs.construct_files_content, &[externs.store_tuple(&files)])
}
