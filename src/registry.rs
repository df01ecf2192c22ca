//! Durable infection registry.
//!
//! The registry is the only owner of `state.json`. Readers work on a cheap
//! snapshot behind a `RwLock`; writers are serialized by an async mutex and
//! every mutation is persisted with write-to-temp, fsync, rename before the
//! snapshot is swapped, so a crash leaves either the old or the new file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{PandemicError, Result};
use crate::infection::{Infection, InfectionId};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    infections: BTreeMap<InfectionId, Infection>,
}

pub struct InfectionRegistry {
    path: PathBuf,
    snapshot: RwLock<BTreeMap<InfectionId, Infection>>,
    /// Held by writers; `true` once the registry is closed.
    writer: Mutex<bool>,
}

impl InfectionRegistry {
    /// Load `path`, starting empty when it does not exist. Anything
    /// unreadable is reported as `StateCorruption`.
    pub fn load(path: &Path) -> Result<Self> {
        let corrupt = |reason: String| PandemicError::StateCorruption {
            path: path.display().to_string(),
            reason,
        };

        let infections = match fs::read(path) {
            Ok(bytes) => {
                let file: StateFile =
                    serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;
                if file.version != FORMAT_VERSION {
                    return Err(corrupt(format!(
                        "unsupported format version {}",
                        file.version
                    )));
                }
                for (id, record) in &file.infections {
                    if *id != record.id {
                        return Err(corrupt(format!(
                            "entry {id} holds record for {}",
                            record.id
                        )));
                    }
                }
                file.infections
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No state file, starting empty");
                BTreeMap::new()
            }
            Err(e) => return Err(corrupt(e.to_string())),
        };

        info!(path = %path.display(), count = infections.len(), "Loaded infection registry");
        Ok(Self {
            path: path.to_path_buf(),
            snapshot: RwLock::new(infections),
            writer: Mutex::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn list(&self) -> Vec<Infection> {
        self.read_snapshot().values().cloned().collect()
    }

    pub fn get(&self, id: &InfectionId) -> Result<Infection> {
        self.read_snapshot()
            .get(id)
            .cloned()
            .ok_or_else(|| PandemicError::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &InfectionId) -> bool {
        self.read_snapshot().contains_key(id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<Infection> {
        self.read_snapshot()
            .values()
            .find(|record| record.name == name)
            .cloned()
    }

    pub async fn upsert(&self, record: Infection) -> Result<Infection> {
        self.mutate(|map| {
            map.insert(record.id.clone(), record.clone());
            Ok(record)
        })
        .await
    }

    /// Apply `f` to the stored record and persist the result.
    pub async fn update<F>(&self, id: &InfectionId, f: F) -> Result<Infection>
    where
        F: FnOnce(&mut Infection) -> Result<()>,
    {
        self.mutate(|map| {
            let record = map
                .get_mut(id)
                .ok_or_else(|| PandemicError::NotFound(id.to_string()))?;
            f(record)?;
            record.touch();
            Ok(record.clone())
        })
        .await
    }

    pub async fn delete(&self, id: &InfectionId) -> Result<Option<Infection>> {
        self.mutate(|map| Ok(map.remove(id))).await
    }

    /// Flush the current snapshot and refuse further mutations.
    pub async fn close(&self) -> Result<()> {
        let mut closed = self.writer.lock().await;
        if *closed {
            return Ok(());
        }
        let snapshot = self.read_snapshot().clone();
        persist(&self.path, &snapshot)?;
        *closed = true;
        info!(path = %self.path.display(), "Infection registry closed");
        Ok(())
    }

    async fn mutate<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut BTreeMap<InfectionId, Infection>) -> Result<T>,
    {
        let closed = self.writer.lock().await;
        if *closed {
            return Err(PandemicError::conflict("infection registry is closed"));
        }

        let mut next = self.read_snapshot().clone();
        let out = f(&mut next)?;
        persist(&self.path, &next)?;
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = next;
        Ok(out)
    }

    fn read_snapshot(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<InfectionId, Infection>> {
        self.snapshot.read().unwrap_or_else(PoisonError::into_inner)
    }
}

fn encode(infections: &BTreeMap<InfectionId, Infection>) -> Result<Vec<u8>> {
    #[derive(Serialize)]
    struct StateFileRef<'a> {
        version: u32,
        infections: &'a BTreeMap<InfectionId, Infection>,
    }
    let mut bytes = serde_json::to_vec_pretty(&StateFileRef {
        version: FORMAT_VERSION,
        infections,
    })?;
    bytes.push(b'\n');
    Ok(bytes)
}

fn persist(path: &Path, infections: &BTreeMap<InfectionId, Infection>) -> Result<()> {
    let bytes = encode(infections)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state.json".to_string());
    let tmp = dir.join(format!(".{file_name}.tmp"));

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(&tmp)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)?;
    File::open(dir)?.sync_all()?;
    debug!(path = %path.display(), bytes = bytes.len(), "Persisted registry");
    Ok(())
}
