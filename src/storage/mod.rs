//! Team aggregate persistence
//!
//! Teams are stored as JSON files under `<repo>/.gitswarm/teams/{id}.json`
//! with an `index.json` for listing. Writes go through a temp file + rename
//! and hold an advisory lock so concurrent processes never interleave.
//! The orchestration core only sees the `TeamStore` trait; tests use the
//! in-memory implementation.

use crate::models::{AgentProfile, ConflictRecord, Run, Team, WorkItem};
use crate::utils::{lock_mutex_recover, teams_dir};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Version of the team file format
const TEAM_FILE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Team not found: {0}")]
    TeamNotFound(String),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

fn io_err(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Team file with the full aggregate embedded. Agents, work items, runs,
/// and conflict records are owned by the team, so deleting the file is the
/// cascading delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamFile {
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    pub team: Team,
    pub agents: Vec<AgentProfile>,
    pub work_items: Vec<WorkItem>,
    pub runs: Vec<Run>,
    pub conflicts: Vec<ConflictRecord>,
}

impl TeamFile {
    pub fn new(team: Team) -> Self {
        Self {
            version: TEAM_FILE_VERSION,
            updated_at: Utc::now(),
            team,
            agents: Vec::new(),
            work_items: Vec::new(),
            runs: Vec::new(),
            conflicts: Vec::new(),
        }
    }
}

/// Minimal listing info kept in index.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamIndexEntry {
    pub id: String,
    pub name: String,
    pub status: String,
    pub updated_at: DateTime<Utc>,
    pub agent_count: u32,
    pub work_item_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexFile {
    version: u32,
    updated_at: DateTime<Utc>,
    entries: Vec<TeamIndexEntry>,
}

impl Default for IndexFile {
    fn default() -> Self {
        Self {
            version: TEAM_FILE_VERSION,
            updated_at: Utc::now(),
            entries: Vec::new(),
        }
    }
}

/// Persistence seam injected into the lifecycle manager.
pub trait TeamStore: Send + Sync {
    fn load_team(&self, team_id: &str) -> StorageResult<Option<TeamFile>>;
    fn save_team(&self, file: &TeamFile) -> StorageResult<()>;
    /// Deletes the team and everything it owns.
    fn delete_team(&self, team_id: &str) -> StorageResult<()>;
    fn list_teams(&self) -> StorageResult<Vec<TeamIndexEntry>>;
}

/// Create a directory and any missing parents.
pub fn ensure_dir(path: &Path) -> StorageResult<()> {
    fs::create_dir_all(path).map_err(|e| io_err(path, e))
}

/// Write `content` atomically: temp file in the same directory, then rename.
pub fn atomic_write(path: &Path, content: &str) -> StorageResult<()> {
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, content).map_err(|e| io_err(&tmp_path, e))?;
    fs::rename(&tmp_path, path).map_err(|e| io_err(path, e))
}

/// Read and deserialize a JSON file.
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> StorageResult<T> {
    let content = fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    Ok(serde_json::from_str(&content)?)
}

/// File-backed store rooted at one repository's `.gitswarm` directory.
pub struct FileTeamStore {
    repo_path: PathBuf,
}

impl FileTeamStore {
    pub fn new<P: AsRef<Path>>(repo_path: P) -> Self {
        Self {
            repo_path: repo_path.as_ref().to_path_buf(),
        }
    }

    fn team_path(&self, team_id: &str) -> PathBuf {
        teams_dir(&self.repo_path).join(format!("{}.json", team_id))
    }

    fn index_path(&self) -> PathBuf {
        teams_dir(&self.repo_path).join("index.json")
    }

    /// Take the directory-wide advisory lock for the duration of a write.
    /// The guard releases on drop.
    fn lock(&self) -> StorageResult<fs::File> {
        let dir = teams_dir(&self.repo_path);
        ensure_dir(&dir)?;
        let lock_path = dir.join(".lock");
        let file = fs::File::create(&lock_path).map_err(|e| io_err(&lock_path, e))?;
        file.lock_exclusive().map_err(|e| io_err(&lock_path, e))?;
        Ok(file)
    }

    fn read_index(&self) -> StorageResult<IndexFile> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(IndexFile::default());
        }
        read_json(&path)
    }

    fn write_index(&self, mut index: IndexFile) -> StorageResult<()> {
        index.updated_at = Utc::now();
        let content = serde_json::to_string_pretty(&index)?;
        atomic_write(&self.index_path(), &content)
    }

    fn index_entry(file: &TeamFile) -> TeamIndexEntry {
        TeamIndexEntry {
            id: file.team.id.clone(),
            name: file.team.name.clone(),
            status: format!("{:?}", file.team.status).to_lowercase(),
            updated_at: file.updated_at,
            agent_count: file.agents.len() as u32,
            work_item_count: file.work_items.len() as u32,
        }
    }
}

impl TeamStore for FileTeamStore {
    fn load_team(&self, team_id: &str) -> StorageResult<Option<TeamFile>> {
        let path = self.team_path(team_id);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    fn save_team(&self, file: &TeamFile) -> StorageResult<()> {
        let _guard = self.lock()?;

        let mut on_disk = file.clone();
        on_disk.updated_at = Utc::now();
        let content = serde_json::to_string_pretty(&on_disk)?;
        atomic_write(&self.team_path(&file.team.id), &content)?;

        let mut index = self.read_index()?;
        let entry = Self::index_entry(&on_disk);
        match index.entries.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => *existing = entry,
            None => index.entries.push(entry),
        }
        self.write_index(index)?;

        log::debug!("[FileTeamStore] Saved team {}", file.team.id);
        Ok(())
    }

    fn delete_team(&self, team_id: &str) -> StorageResult<()> {
        let _guard = self.lock()?;

        let path = self.team_path(team_id);
        if !path.exists() {
            return Err(StorageError::TeamNotFound(team_id.to_string()));
        }
        fs::remove_file(&path).map_err(|e| io_err(&path, e))?;

        let mut index = self.read_index()?;
        index.entries.retain(|e| e.id != team_id);
        self.write_index(index)?;

        log::info!("[FileTeamStore] Deleted team {}", team_id);
        Ok(())
    }

    fn list_teams(&self) -> StorageResult<Vec<TeamIndexEntry>> {
        Ok(self.read_index()?.entries)
    }
}

/// In-memory store for deterministic tests.
#[derive(Default)]
pub struct MemoryTeamStore {
    teams: Mutex<HashMap<String, TeamFile>>,
}

impl MemoryTeamStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TeamStore for MemoryTeamStore {
    fn load_team(&self, team_id: &str) -> StorageResult<Option<TeamFile>> {
        Ok(lock_mutex_recover(&self.teams).get(team_id).cloned())
    }

    fn save_team(&self, file: &TeamFile) -> StorageResult<()> {
        let mut on_disk = file.clone();
        on_disk.updated_at = Utc::now();
        lock_mutex_recover(&self.teams).insert(file.team.id.clone(), on_disk);
        Ok(())
    }

    fn delete_team(&self, team_id: &str) -> StorageResult<()> {
        match lock_mutex_recover(&self.teams).remove(team_id) {
            Some(_) => Ok(()),
            None => Err(StorageError::TeamNotFound(team_id.to_string())),
        }
    }

    fn list_teams(&self) -> StorageResult<Vec<TeamIndexEntry>> {
        Ok(lock_mutex_recover(&self.teams)
            .values()
            .map(FileTeamStore::index_entry)
            .collect())
    }
}
