#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use campaign_domain::{
    artifact_suffix, ArtifactKind, InputSummary, RunPrefix, Stage, StageRecord, RESULTS_ROOT,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use ulid::Ulid;

/// Read-modify-write callback for [`ArtifactStore::update`]. Receives the
/// current bytes (if any) and returns the replacement.
pub type UpdateFn<'a> = dyn FnMut(Option<Vec<u8>>) -> Result<Vec<u8>> + 'a;

/// Blob-style key/value store addressed by `/`-separated relative paths.
pub trait ArtifactStore: Send + Sync {
    /// Full overwrite; readers observe either the old or the new bytes.
    #[allow(clippy::missing_errors_doc)]
    fn put(&self, path: &str, bytes: &[u8]) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Every stored path starting with `prefix`, sorted.
    #[allow(clippy::missing_errors_doc)]
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Atomic with respect to every other `put`/`update` on this store.
    #[allow(clippy::missing_errors_doc)]
    fn update(&self, path: &str, apply: &mut UpdateFn<'_>) -> Result<()>;
}

pub struct FsArtifactStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FsArtifactStore {
    /// Open a filesystem store rooted at `root`, creating the directory.
    ///
    /// # Errors
    /// Returns an error if the root directory cannot be created.
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("failed to create artifact root {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        if path.is_empty()
            || path.ends_with('/')
            || !relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)))
        {
            return Err(anyhow!("invalid artifact path: {path:?}"));
        }
        Ok(self.root.join(relative))
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| anyhow!("artifact write lock poisoned"))
    }

    fn write_atomic(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let target = self.resolve(path)?;
        let parent = target
            .parent()
            .ok_or_else(|| anyhow!("artifact path has no parent: {path}"))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;

        let file_name = target
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| anyhow!("artifact path has no file name: {path}"))?;
        let temp = parent.join(format!(".{file_name}.tmp-{}", Ulid::new()));
        {
            let mut file = fs::File::create(&temp)
                .with_context(|| format!("failed to create {}", temp.display()))?;
            file.write_all(bytes)
                .with_context(|| format!("failed to write {}", temp.display()))?;
            file.sync_all()
                .with_context(|| format!("failed to sync {}", temp.display()))?;
        }
        fs::rename(&temp, &target).with_context(|| {
            format!("failed to move {} into {}", temp.display(), target.display())
        })?;
        debug!(path, bytes = bytes.len(), "artifact written");
        Ok(())
    }

    fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let target = self.resolve(path)?;
        match fs::read(&target) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("failed to read {}", target.display()))
            }
        }
    }
}

impl ArtifactStore for FsArtifactStore {
    fn put(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let _guard = self.lock()?;
        self.write_atomic(path, bytes)
    }

    fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.read(path)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let base_dir = match prefix.rfind('/') {
            Some(idx) => self.root.join(&prefix[..idx]),
            None => self.root.clone(),
        };
        let mut out = Vec::new();
        if base_dir.is_dir() {
            collect_files(&self.root, &base_dir, &mut out)?;
        }
        out.retain(|path| path.starts_with(prefix));
        out.sort();
        Ok(out)
    }

    fn update(&self, path: &str, apply: &mut UpdateFn<'_>) -> Result<()> {
        let _guard = self.lock()?;
        let current = self.read(path)?;
        let next = apply(current)?;
        self.write_atomic(path, &next)
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(root, &path, out)?;
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let relative = path
            .strip_prefix(root)
            .map_err(|_| anyhow!("listed path escaped artifact root: {}", path.display()))?;
        let joined = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        out.push(joined);
    }
    Ok(())
}

#[derive(Default)]
pub struct InMemoryArtifactStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryArtifactStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow!("in-memory artifact store poisoned"))
    }
}

impl ArtifactStore for InMemoryArtifactStore {
    fn put(&self, path: &str, bytes: &[u8]) -> Result<()> {
        self.lock()?.insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock()?.get(path).cloned())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()?
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    fn update(&self, path: &str, apply: &mut UpdateFn<'_>) -> Result<()> {
        let mut entries = self.lock()?;
        let next = apply(entries.get(path).cloned())?;
        entries.insert(path.to_string(), next);
        Ok(())
    }
}

/// Serialize `value` as a pretty JSON artifact and overwrite `path`.
///
/// # Errors
/// Returns an error if serialization or the store write fails.
pub fn put_json<T: Serialize>(store: &dyn ArtifactStore, path: &str, value: &T) -> Result<()> {
    let bytes = campaign_domain::to_artifact_bytes(value)
        .with_context(|| format!("failed to serialize artifact {path}"))?;
    store.put(path, &bytes)
}

/// Read and decode a JSON artifact; `Ok(None)` when absent.
///
/// # Errors
/// Returns an error if the store read fails or the bytes are not valid JSON
/// for `T`.
pub fn get_json<T: DeserializeOwned>(store: &dyn ArtifactStore, path: &str) -> Result<Option<T>> {
    match store.get(path)? {
        Some(bytes) => Ok(Some(
            serde_json::from_slice(&bytes)
                .with_context(|| format!("artifact {path} is not valid JSON"))?,
        )),
        None => Ok(None),
    }
}

/// How a run's artifacts are found.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RunLocation<'a> {
    /// The prefix is already known, e.g. recomputed from the run's engine
    /// record. Nothing is scanned.
    Known(&'a RunPrefix),
    /// Only the run id is known; scan for it with [`discover`].
    Discover(&'a str),
}

impl RunLocation<'_> {
    #[must_use]
    pub fn run_id(&self) -> &str {
        match self {
            Self::Known(prefix) => &prefix.run_id,
            Self::Discover(run_id) => run_id,
        }
    }
}

/// Locate a run's artifact by scanning under the results root for a path
/// ending in `/{run_id}/{file}`. The page and date segments of a run's
/// prefix are not derivable from its id, so this is a linear scan.
///
/// Several matches mean two runs share an id; the collision is logged and
/// the path with the latest `yyyy/mm/dd` wins, ties going to the greatest
/// path.
///
/// # Errors
/// Returns an error if listing the store fails.
pub fn discover(
    store: &dyn ArtifactStore,
    run_id: &str,
    kind: ArtifactKind,
) -> Result<Option<String>> {
    let suffix = artifact_suffix(run_id, kind);
    let matches: Vec<(RunPrefix, String)> = store
        .list(RESULTS_ROOT)?
        .into_iter()
        .filter(|path| path.ends_with(&suffix))
        .filter_map(|path| {
            let prefix_len = path.len() - kind.file_name().len();
            let prefix = RunPrefix::parse(&path[..prefix_len]).ok()?;
            Some((prefix, path))
        })
        .collect();

    if matches.len() > 1 {
        let candidates: Vec<&str> = matches.iter().map(|(_, path)| path.as_str()).collect();
        warn!(
            run_id,
            kind = kind.file_name(),
            count = matches.len(),
            ?candidates,
            "run_id collision: several artifacts match one run"
        );
    }

    Ok(matches
        .into_iter()
        .max_by(|(left, left_path), (right, right_path)| {
            (left.year, left.month, left.day)
                .cmp(&(right.year, right.month, right.day))
                .then_with(|| left_path.cmp(right_path))
        })
        .map(|(_, path)| path))
}

/// Locate the prefix of a run from its campaign artifact.
///
/// # Errors
/// Returns an error if listing fails or the discovered path is malformed.
pub fn discover_prefix(store: &dyn ArtifactStore, run_id: &str) -> Result<Option<RunPrefix>> {
    let Some(path) = discover(store, run_id, ArtifactKind::Campaign)? else {
        return Ok(None);
    };
    let prefix_len = path.len() - ArtifactKind::Campaign.file_name().len();
    let prefix = RunPrefix::parse(&path[..prefix_len])?;
    Ok(Some(prefix))
}

/// Path of one artifact of the run at `location`. A known prefix always
/// yields a path, whether or not the artifact exists yet.
///
/// # Errors
/// Returns an error if a discovery scan fails.
pub fn locate(
    store: &dyn ArtifactStore,
    location: RunLocation<'_>,
    kind: ArtifactKind,
) -> Result<Option<String>> {
    match location {
        RunLocation::Known(prefix) => Ok(Some(prefix.artifact_path(kind))),
        RunLocation::Discover(run_id) => discover(store, run_id, kind),
    }
}

/// Raw bytes of a run's artifact.
///
/// # Errors
/// Returns an error if listing or reading the store fails.
pub fn fetch_artifact(
    store: &dyn ArtifactStore,
    location: RunLocation<'_>,
    kind: ArtifactKind,
) -> Result<Option<Vec<u8>>> {
    match locate(store, location, kind)? {
        Some(path) => store.get(&path),
        None => Ok(None),
    }
}

/// Overwrite the run's stage record. Last write wins.
///
/// # Errors
/// Returns an error if serialization or the store write fails.
pub fn write_stage(
    store: &dyn ArtifactStore,
    prefix: &RunPrefix,
    stage: Stage,
    input_summary: InputSummary,
) -> Result<()> {
    let record = StageRecord::new(&prefix.run_id, stage, input_summary);
    put_json(store, &prefix.artifact_path(ArtifactKind::Status), &record)
}

/// Latest stage record of the run at `location`, with `run_id` filled in
/// when the persisted record omits it.
///
/// # Errors
/// Returns an error if discovery fails or the record is malformed.
pub fn read_stage(
    store: &dyn ArtifactStore,
    location: RunLocation<'_>,
) -> Result<Option<StageRecord>> {
    let run_id = location.run_id();
    let Some(path) = locate(store, location, ArtifactKind::Status)? else {
        return Ok(None);
    };
    let record: Option<StageRecord> = get_json(store, &path)?;
    Ok(record.map(|mut record| {
        let missing = match record.run_id.as_deref() {
            Some(id) => id.is_empty(),
            None => true,
        };
        if missing {
            record.run_id = Some(run_id.to_string());
        }
        record
    }))
}
