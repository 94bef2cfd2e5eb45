//! Durable checkpoint store.
//!
//! Layout under the root, per checkpoint id:
//! - `<id>.meta.json`: metadata record (pipeline, step, timestamp, annotations)
//! - `<id>.state.<format>`: opaque state blob
//!
//! Write protocol:
//! - Both records go to `.tmp` files first and are synced
//! - The state file is hard-linked into place, then the metadata file
//! - Linking fails on an existing name, so no record is ever replaced
//! - The metadata link is the commit point: a visible metadata record always
//!   has its state next to it
//!
//! An interrupted write leaves at most `.tmp` files or a state blob without
//! metadata; `sweep` removes both.

use super::{JsonSerializer, StateSerializer};
use crate::models::{CheckpointError, EtlError, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};
use uuid::Uuid;

const META_SUFFIX: &str = ".meta.json";
const STATE_MARKER: &str = ".state.";
const TMP_SUFFIX: &str = ".tmp";
const ID_LEN: usize = 20;

static ID_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Free-form annotations stored with a checkpoint.
pub type Annotations = BTreeMap<String, serde_json::Value>;

/// Metadata record of one checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub id: String,
    pub pipeline: String,
    pub step: String,
    /// Position of `step` in the pipeline's step sequence
    #[serde(default)]
    pub step_index: usize,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub annotations: Annotations,
    /// Serializer format of the state blob (also its file extension)
    pub state_format: String,
    /// Exact byte length of the state blob
    pub state_bytes: u64,
}

/// A loaded checkpoint: metadata plus decoded state.
#[derive(Debug, Clone)]
pub struct Checkpoint<T> {
    pub metadata: CheckpointMetadata,
    pub state: T,
}

/// Where a new checkpoint sits in its pipeline.
#[derive(Debug, Clone, Copy)]
pub struct StepRef<'a> {
    pub pipeline: &'a str,
    pub step: &'a str,
    pub step_index: usize,
}

/// Result of reading every metadata record under the root.
#[derive(Default)]
struct Scan {
    entries: Vec<CheckpointMetadata>,
    unreadable: Vec<(String, EtlError)>,
}

/// Filesystem-backed checkpoint store.
///
/// Writers targeting distinct ids never interfere. Serialising creation per
/// pipeline is the caller's job.
pub struct CheckpointStore<S = JsonSerializer> {
    root: PathBuf,
    serializer: S,
}

impl CheckpointStore<JsonSerializer> {
    /// Open (and create if needed) a JSON store at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        Self::with_serializer(root, JsonSerializer::new())
    }
}

impl<S: StateSerializer> CheckpointStore<S> {
    pub fn with_serializer(root: impl Into<PathBuf>, serializer: S) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| CheckpointError::storage("creating checkpoint root", e))?;
        Ok(Self { root, serializer })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}{META_SUFFIX}"))
    }

    fn state_path(&self, id: &str, format: &str) -> PathBuf {
        self.root.join(format!("{id}{STATE_MARKER}{format}"))
    }

    /// Persist `state` for `step` and return the new checkpoint id.
    pub fn create<T: Serialize + ?Sized>(
        &self,
        at: StepRef<'_>,
        state: &T,
        annotations: Annotations,
    ) -> Result<String> {
        self.write(generate_id(at.pipeline), at, state, annotations)
    }

    fn write<T: Serialize + ?Sized>(
        &self,
        id: String,
        at: StepRef<'_>,
        state: &T,
        annotations: Annotations,
    ) -> Result<String> {
        let format = self.serializer.format().to_string();
        let meta_path = self.meta_path(&id);
        let state_path = self.state_path(&id, &format);

        let blob = self.serializer.encode(state)?;
        let metadata = CheckpointMetadata {
            id: id.clone(),
            pipeline: at.pipeline.to_string(),
            step: at.step.to_string(),
            step_index: at.step_index,
            timestamp: Utc::now(),
            annotations,
            state_format: format,
            state_bytes: blob.len() as u64,
        };
        let meta = serde_json::to_vec_pretty(&metadata)?;

        let state_tmp = tmp_path(&state_path);
        let meta_tmp = tmp_path(&meta_path);
        write_synced(&state_tmp, &blob)?;
        write_synced(&meta_tmp, &meta)?;

        if let Err(e) = commit(&state_tmp, &state_path, &id) {
            remove_if_present(&meta_tmp)?;
            return Err(e);
        }
        if let Err(e) = commit(&meta_tmp, &meta_path, &id) {
            remove_if_present(&state_path)?;
            return Err(e);
        }

        info!(
            checkpoint = %id,
            pipeline = at.pipeline,
            step = at.step,
            bytes = metadata.state_bytes,
            "Checkpoint created"
        );
        Ok(id)
    }

    /// Read only the metadata record of `id`.
    pub fn metadata(&self, id: &str) -> Result<CheckpointMetadata> {
        let raw = match fs::read(self.meta_path(id)) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CheckpointError::NotFound(id.to_string()).into());
            }
            Err(e) => return Err(CheckpointError::storage("reading checkpoint metadata", e).into()),
        };
        let metadata: CheckpointMetadata = serde_json::from_slice(&raw)
            .map_err(|e| CheckpointError::corrupt(id, format!("unreadable metadata: {e}")))?;
        if metadata.id != id {
            return Err(CheckpointError::corrupt(
                id,
                format!("metadata names a different id '{}'", metadata.id),
            )
            .into());
        }
        Ok(metadata)
    }

    /// Load metadata and state of `id`.
    ///
    /// Fails with `NotFound` when there is no metadata record and with
    /// `Corrupt` when the state is missing, truncated or undecodable.
    pub fn load<T: DeserializeOwned>(&self, id: &str) -> Result<Checkpoint<T>> {
        let metadata = self.metadata(id)?;

        if metadata.state_format != self.serializer.format() {
            return Err(CheckpointError::corrupt(
                id,
                format!(
                    "state format '{}' cannot be read as '{}'",
                    metadata.state_format,
                    self.serializer.format()
                ),
            )
            .into());
        }

        let blob = match fs::read(self.state_path(id, &metadata.state_format)) {
            Ok(blob) => blob,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(CheckpointError::corrupt(id, "state record is missing").into());
            }
            Err(e) => return Err(CheckpointError::storage("reading checkpoint state", e).into()),
        };
        if blob.len() as u64 != metadata.state_bytes {
            return Err(CheckpointError::corrupt(
                id,
                format!(
                    "state is {} bytes, metadata records {}",
                    blob.len(),
                    metadata.state_bytes
                ),
            )
            .into());
        }

        let state = self
            .serializer
            .decode(&blob)
            .map_err(|e| CheckpointError::corrupt(id, e.to_string()))?;

        debug!(checkpoint = %id, step = %metadata.step, "Checkpoint loaded");
        Ok(Checkpoint { metadata, state })
    }

    /// Metadata of every checkpoint, newest first, optionally for one pipeline.
    ///
    /// Unreadable metadata files are skipped with a warning.
    pub fn list(&self, pipeline: Option<&str>) -> Result<Vec<CheckpointMetadata>> {
        let scan = self.scan(pipeline)?;
        for (id, e) in &scan.unreadable {
            warn!(checkpoint = %id, error = %e, "Skipping checkpoint");
        }
        Ok(scan.entries)
    }

    /// Newest checkpoint of `pipeline`, loaded, if any.
    ///
    /// Fails with `Corrupt` when any metadata record under the root is
    /// unreadable: its pipeline is unknown, so it may be the newest one.
    pub fn latest<T: DeserializeOwned>(&self, pipeline: &str) -> Result<Option<Checkpoint<T>>> {
        let scan = self.scan(Some(pipeline))?;
        if let Some((id, e)) = scan.unreadable.into_iter().next() {
            return Err(CheckpointError::corrupt(
                id,
                format!("cannot pick the latest checkpoint of '{pipeline}': {e}"),
            )
            .into());
        }
        match scan.entries.first() {
            Some(newest) => self.load(&newest.id).map(Some),
            None => Ok(None),
        }
    }

    fn scan(&self, pipeline: Option<&str>) -> Result<Scan> {
        let mut scan = Scan::default();

        for path in self.matching(&format!("*{META_SUFFIX}"))? {
            let Some(id) = file_name(&path).and_then(|n| n.strip_suffix(META_SUFFIX)) else {
                continue;
            };
            match self.metadata(id) {
                Ok(metadata) => {
                    if pipeline.map_or(true, |p| p == metadata.pipeline) {
                        scan.entries.push(metadata);
                    }
                }
                // Deleted since the glob ran.
                Err(EtlError::Checkpoint(CheckpointError::NotFound(_))) => {}
                Err(e) => scan.unreadable.push((id.to_string(), e)),
            }
        }

        scan.entries.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then(b.step_index.cmp(&a.step_index))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(scan)
    }

    /// Remove checkpoint `id`, metadata first.
    pub fn delete(&self, id: &str) -> Result<()> {
        let format = self
            .metadata(id)
            .map(|m| m.state_format)
            .unwrap_or_else(|_| self.serializer.format().to_string());

        let meta_removed = remove_if_present(&self.meta_path(id))?;
        let state_removed = remove_if_present(&self.state_path(id, &format))?;
        if !meta_removed && !state_removed {
            return Err(CheckpointError::NotFound(id.to_string()).into());
        }

        info!(checkpoint = %id, "Checkpoint deleted");
        Ok(())
    }

    /// Keep the `keep_last` newest checkpoints of `pipeline`; returns how many
    /// were removed.
    pub fn prune(&self, pipeline: &str, keep_last: usize) -> Result<usize> {
        let entries = self.list(Some(pipeline))?;
        if entries.len() <= keep_last {
            return Ok(0);
        }

        let stale = &entries[keep_last..];
        for metadata in stale {
            self.delete(&metadata.id)?;
        }

        info!(pipeline, removed = stale.len(), kept = keep_last, "Old checkpoints pruned");
        Ok(stale.len())
    }

    /// Remove leftovers of interrupted writes: temp files and state blobs
    /// without metadata. Returns the number of files removed.
    ///
    /// Must not run while a writer is active on the same root.
    pub fn sweep(&self) -> Result<usize> {
        let mut removed = 0;

        for path in self.matching(&format!("*{TMP_SUFFIX}"))? {
            if remove_if_present(&path)? {
                removed += 1;
            }
        }

        for path in self.matching(&format!("*{STATE_MARKER}*"))? {
            let Some(id) = file_name(&path).and_then(|n| n.split(STATE_MARKER).next()) else {
                continue;
            };
            if !self.meta_path(id).exists() && remove_if_present(&path)? {
                warn!(path = %path.display(), "Removed orphaned checkpoint state");
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "Checkpoint root swept");
        }
        Ok(removed)
    }

    fn matching(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        let root = glob::Pattern::escape(&self.root.to_string_lossy());
        let paths = glob::glob(&format!("{root}/{pattern}"))
            .map_err(|e| EtlError::Internal(format!("Invalid glob pattern: {e}")))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(paths)
    }
}

/// Hash pipeline name, wall-clock nanos, process id and a process-local
/// sequence into a short hex id.
fn generate_id(pipeline: &str) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let sequence = ID_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let name = format!("{pipeline}\0{nanos}\0{}\0{sequence}", std::process::id());
    let mut id = Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
        .simple()
        .to_string();
    id.truncate(ID_LEN);
    id
}

/// Link `tmp` to `dest` without replacing an existing file, then drop `tmp`.
fn commit(tmp: &Path, dest: &Path, id: &str) -> Result<()> {
    let linked = fs::hard_link(tmp, dest);
    remove_if_present(tmp)?;
    match linked {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            Err(CheckpointError::Collision(id.to_string()).into())
        }
        Err(e) => Err(CheckpointError::storage("committing checkpoint", e).into()),
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(TMP_SUFFIX);
    PathBuf::from(name)
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file =
        File::create(path).map_err(|e| CheckpointError::storage("creating checkpoint file", e))?;
    file.write_all(bytes)
        .map_err(|e| CheckpointError::storage("writing checkpoint file", e))?;
    file.sync_all()
        .map_err(|e| CheckpointError::storage("syncing checkpoint file", e))?;
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(CheckpointError::storage("removing checkpoint file", e).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn store() -> (TempDir, CheckpointStore) {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("cp")).unwrap();
        (dir, store)
    }

    fn at(pipeline: &'static str, step: &'static str, step_index: usize) -> StepRef<'static> {
        StepRef {
            pipeline,
            step,
            step_index,
        }
    }

    fn is_checkpoint_err(err: &EtlError, f: impl Fn(&CheckpointError) -> bool) -> bool {
        matches!(err, EtlError::Checkpoint(inner) if f(inner))
    }

    #[test]
    fn test_create_then_load() {
        let (_dir, store) = store();
        let state = vec![json!({"id": 1, "name": "a"}), json!({"id": 2, "name": null})];
        let mut annotations = Annotations::new();
        annotations.insert("rows".to_string(), json!(2));

        let id = store
            .create(at("orders", "extract", 0), &state, annotations)
            .unwrap();
        let loaded: Checkpoint<Vec<serde_json::Value>> = store.load(&id).unwrap();

        assert_eq!(loaded.state, state);
        assert_eq!(loaded.metadata.pipeline, "orders");
        assert_eq!(loaded.metadata.step, "extract");
        assert_eq!(loaded.metadata.annotations["rows"], json!(2));
        assert_eq!(loaded.metadata.state_format, "json");
        assert!(store.root().join(format!("{id}.meta.json")).exists());
        assert!(store.root().join(format!("{id}.state.json")).exists());
    }

    #[test]
    fn test_list_newest_first_and_filtered() {
        let (_dir, store) = store();
        let a = store.create(at("a", "s0", 0), &1u32, Annotations::new()).unwrap();
        let b = store.create(at("a", "s1", 1), &2u32, Annotations::new()).unwrap();
        store.create(at("b", "s0", 0), &3u32, Annotations::new()).unwrap();

        let ids: Vec<String> = store.list(Some("a")).unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![b, a]);
        assert_eq!(store.list(None).unwrap().len(), 3);
        assert!(store.list(Some("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_latest() {
        let (_dir, store) = store();
        assert!(store.latest::<u32>("p").unwrap().is_none());

        store.create(at("p", "first", 0), &10u32, Annotations::new()).unwrap();
        store.create(at("p", "second", 1), &20u32, Annotations::new()).unwrap();

        let latest = store.latest::<u32>("p").unwrap().unwrap();
        assert_eq!(latest.state, 20);
        assert_eq!(latest.metadata.step, "second");
    }

    #[test]
    fn test_prune_keeps_most_recent() {
        let (_dir, store) = store();
        let ids: Vec<String> = (0..7)
            .map(|i| {
                store
                    .create(at("p", "step", i), &i, Annotations::new())
                    .unwrap()
            })
            .collect();
        store.create(at("other", "step", 0), &0u32, Annotations::new()).unwrap();

        assert_eq!(store.prune("p", 3).unwrap(), 4);
        let kept: Vec<String> = store.list(Some("p")).unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(kept, vec![ids[6].clone(), ids[5].clone(), ids[4].clone()]);
        assert_eq!(store.list(Some("other")).unwrap().len(), 1);

        assert_eq!(store.prune("p", 10).unwrap(), 0);
        assert_eq!(store.list(Some("p")).unwrap().len(), 3);
    }

    #[test]
    fn test_missing_metadata_is_not_found() {
        let (_dir, store) = store();
        let id = store.create(at("p", "s", 0), &"x", Annotations::new()).unwrap();
        fs::remove_file(store.root().join(format!("{id}.meta.json"))).unwrap();

        let err = store.load::<String>(&id).unwrap_err();
        assert!(is_checkpoint_err(&err, |e| matches!(e, CheckpointError::NotFound(_))));
        assert!(err.is_recovery_failure());
    }

    #[test]
    fn test_missing_state_is_corrupt() {
        let (_dir, store) = store();
        let id = store.create(at("p", "s", 0), &"x", Annotations::new()).unwrap();
        fs::remove_file(store.root().join(format!("{id}.state.json"))).unwrap();

        let err = store.load::<String>(&id).unwrap_err();
        assert!(is_checkpoint_err(&err, |e| matches!(e, CheckpointError::Corrupt { .. })));
    }

    #[test]
    fn test_truncated_state_is_corrupt() {
        let (_dir, store) = store();
        let id = store
            .create(at("p", "s", 0), &vec![1u32, 2, 3], Annotations::new())
            .unwrap();
        fs::write(store.root().join(format!("{id}.state.json")), b"[1,2").unwrap();

        let err = store.load::<Vec<u32>>(&id).unwrap_err();
        assert!(is_checkpoint_err(&err, |e| matches!(e, CheckpointError::Corrupt { .. })));
    }

    #[test]
    fn test_undecodable_state_is_corrupt() {
        let (_dir, store) = store();
        let id = store.create(at("p", "s", 0), &"text", Annotations::new()).unwrap();

        let err = store.load::<Vec<u32>>(&id).unwrap_err();
        assert!(is_checkpoint_err(&err, |e| matches!(e, CheckpointError::Corrupt { .. })));
    }

    #[test]
    fn test_delete() {
        let (_dir, store) = store();
        let id = store.create(at("p", "s", 0), &1u8, Annotations::new()).unwrap();

        store.delete(&id).unwrap();
        assert!(store.list(None).unwrap().is_empty());
        assert!(!store.root().join(format!("{id}.state.json")).exists());

        let err = store.delete(&id).unwrap_err();
        assert!(is_checkpoint_err(&err, |e| matches!(e, CheckpointError::NotFound(_))));
    }

    #[test]
    fn test_list_skips_unreadable_metadata() {
        let (_dir, store) = store();
        store.create(at("p", "s", 0), &1u8, Annotations::new()).unwrap();
        fs::write(store.root().join("garbage.meta.json"), b"{").unwrap();

        assert_eq!(store.list(None).unwrap().len(), 1);
    }

    #[test]
    fn test_sweep_removes_interrupted_writes() {
        let (_dir, store) = store();
        let kept = store.create(at("p", "s", 0), &1u8, Annotations::new()).unwrap();

        // Crash after the state link, before the metadata commit.
        fs::write(store.root().join("deadbeef.state.json"), b"1").unwrap();
        // Crash before any link.
        fs::write(store.root().join("cafe.state.json.tmp"), b"1").unwrap();
        fs::write(store.root().join("cafe.meta.json.tmp"), b"{}").unwrap();

        assert_eq!(store.sweep().unwrap(), 3);
        assert_eq!(store.sweep().unwrap(), 0);
        let loaded: Checkpoint<u8> = store.load(&kept).unwrap();
        assert_eq!(loaded.state, 1);
    }

    #[test]
    fn test_ids_are_unique() {
        let ids: HashSet<String> = (0..10_000).map(|_| generate_id("p")).collect();
        assert_eq!(ids.len(), 10_000);
        assert!(ids.iter().all(|id| id.len() == ID_LEN));
    }

    #[test]
    fn test_collision_is_an_error() {
        let (_dir, store) = store();
        let id = store.create(at("p", "s", 0), &1u8, Annotations::new()).unwrap();

        let err = store
            .write(id.clone(), at("p", "s", 1), &2u8, Annotations::new())
            .unwrap_err();
        assert!(is_checkpoint_err(&err, |e| matches!(e, CheckpointError::Collision(_))));

        let original: Checkpoint<u8> = store.load(&id).unwrap();
        assert_eq!(original.state, 1);
    }

    #[test]
    fn test_collision_on_metadata_keeps_existing_record() {
        let (_dir, store) = store();
        let id = store.create(at("p", "s", 0), &1u8, Annotations::new()).unwrap();
        fs::remove_file(store.state_path(&id, "json")).unwrap();

        // State links cleanly, the metadata link then hits the existing record.
        let err = store
            .write(id.clone(), at("p", "s", 7), &2u8, Annotations::new())
            .unwrap_err();
        assert!(is_checkpoint_err(&err, |e| matches!(e, CheckpointError::Collision(_))));

        assert_eq!(store.metadata(&id).unwrap().step_index, 0);
        assert!(!store.state_path(&id, "json").exists());
        assert_eq!(store.sweep().unwrap(), 0);
    }

    #[test]
    fn test_latest_refuses_unreadable_metadata() {
        let (_dir, store) = store();
        store.create(at("p", "s", 0), &1u8, Annotations::new()).unwrap();
        fs::write(store.root().join("garbage.meta.json"), b"{").unwrap();

        let err = store.latest::<u8>("p").unwrap_err();
        assert!(is_checkpoint_err(&err, |e| matches!(e, CheckpointError::Corrupt { .. })));
        assert!(err.is_recovery_failure());
        assert_eq!(store.list(Some("p")).unwrap().len(), 1);
    }
}
