//! Installed-tool state: load, save (atomic), and per-version records.
//!
//! Readers hold a shared advisory lock on `state.json.lock`; writers hold it
//! exclusively across load-modify-save, so concurrent installs do not drop
//! each other's records.

use super::error::{Error, Result};
use super::plan_cache::PlanStore;
use super::types::{InstallationPlan, State, VersionState};
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// `state.json` on disk.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    /// Open the lock file and take the lock. Released when the file drops.
    fn lock(&self, exclusive: bool) -> Result<File> {
        let lock_path = self.lock_path();
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| Error::io(&lock_path, e))?;
        let locked = if exclusive {
            fs2::FileExt::lock_exclusive(&file)
        } else {
            fs2::FileExt::lock_shared(&file)
        };
        locked.map_err(|e| Error::io(&lock_path, e))?;
        Ok(file)
    }

    /// Load state. A missing file is an empty state.
    pub fn load(&self) -> Result<State> {
        if !self.path.exists() {
            return Ok(State::default());
        }
        let _guard = self.lock(false)?;
        self.read_unlocked()
    }

    fn read_unlocked(&self) -> Result<State> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(State::default()),
            Err(e) => return Err(Error::io(&self.path, e)),
        };
        Ok(serde_json::from_str(&content)?)
    }

    /// Save atomically (write to temp, then rename).
    pub fn save(&self, state: &State) -> Result<()> {
        let _guard = self.lock(true)?;
        self.write_unlocked(state)
    }

    fn write_unlocked(&self, state: &State) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let json = serde_json::to_string_pretty(state)?;

        let tmp_path = self.path.with_extension(format!("json.{}.tmp", std::process::id()));
        std::fs::write(&tmp_path, json).map_err(|e| Error::io(&tmp_path, e))?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| Error::io(&self.path, e))?;
        Ok(())
    }

    /// Load, apply `f`, save, all under the exclusive lock.
    pub fn update<T>(&self, f: impl FnOnce(&mut State) -> T) -> Result<T> {
        let _guard = self.lock(true)?;
        let mut state = self.read_unlocked()?;
        let out = f(&mut state);
        self.write_unlocked(&state)?;
        Ok(out)
    }

    pub fn cached_plan(&self, tool: &str, version: &str) -> Result<Option<InstallationPlan>> {
        let state = self.load()?;
        Ok(state
            .tools
            .get(tool)
            .and_then(|t| t.versions.get(version))
            .and_then(|v| v.plan.clone()))
    }

    /// Remember a generated plan without marking the version installed.
    pub fn store_plan(&self, plan: &InstallationPlan, requested: &str) -> Result<()> {
        self.update(|state| {
            let entry = version_entry(state, &plan.tool, &plan.version);
            entry.plan = Some(plan.clone());
            if entry.requested.is_empty() {
                entry.requested = requested.to_string();
            }
        })
    }

    /// Mark a version installed and make it the active one.
    pub fn record_install(
        &self,
        plan: &InstallationPlan,
        requested: &str,
        install_hash: Option<String>,
    ) -> Result<()> {
        self.update(|state| {
            let entry = version_entry(state, &plan.tool, &plan.version);
            entry.requested = requested.to_string();
            entry.installed_at = Some(Utc::now());
            entry.install_hash = install_hash;
            entry.plan = Some(plan.clone());
            if let Some(tool) = state.tools.get_mut(&plan.tool) {
                tool.active_version = Some(plan.version.clone());
            }
        })
    }

    /// The active installed version of `tool`, if any.
    pub fn installed_version(&self, tool: &str) -> Result<Option<String>> {
        let state = self.load()?;
        Ok(state.tools.get(tool).and_then(|t| {
            t.active_version
                .as_ref()
                .filter(|v| t.versions.get(*v).is_some_and(|s| s.installed_at.is_some()))
                .cloned()
        }))
    }

    pub fn is_installed(&self, tool: &str, version: &str) -> Result<bool> {
        let state = self.load()?;
        Ok(state
            .tools
            .get(tool)
            .and_then(|t| t.versions.get(version))
            .is_some_and(|v| v.installed_at.is_some()))
    }
}

fn version_entry<'a>(state: &'a mut State, tool: &str, version: &str) -> &'a mut VersionState {
    state
        .tools
        .entry(tool.to_string())
        .or_default()
        .versions
        .entry(version.to_string())
        .or_default()
}

impl PlanStore for StateStore {
    fn get_plan(&self, tool: &str, version: &str) -> Result<Option<InstallationPlan>> {
        self.cached_plan(tool, version)
    }

    fn put_plan(&self, plan: &InstallationPlan, requested: &str) -> Result<()> {
        self.store_plan(plan, requested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Platform, RecipeType, PLAN_FORMAT_VERSION};

    fn plan(tool: &str, version: &str) -> InstallationPlan {
        InstallationPlan {
            format_version: PLAN_FORMAT_VERSION,
            tool: tool.into(),
            version: version.into(),
            platform: Platform::host(),
            generated_at: Utc::now(),
            recipe_hash: "blake3:abc".into(),
            recipe_source: "memory".into(),
            recipe_type: RecipeType::Tool,
            deterministic: true,
            steps: vec![],
            verify: None,
        }
    }

    #[test]
    fn test_load_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        assert!(store.load().unwrap().tools.is_empty());
        assert_eq!(store.installed_version("jq").unwrap(), None);
    }

    #[test]
    fn test_store_plan_is_not_install() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        store.store_plan(&plan("jq", "1.7.1"), "latest").unwrap();

        assert_eq!(store.cached_plan("jq", "1.7.1").unwrap().unwrap().version, "1.7.1");
        assert!(!store.is_installed("jq", "1.7.1").unwrap());
        assert_eq!(store.installed_version("jq").unwrap(), None);
    }

    #[test]
    fn test_record_install() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nested").join("state.json"));
        store
            .record_install(&plan("jq", "1.7.1"), "1.7", Some("blake3:tree".into()))
            .unwrap();

        assert!(store.is_installed("jq", "1.7.1").unwrap());
        assert_eq!(store.installed_version("jq").unwrap().as_deref(), Some("1.7.1"));
        let state = store.load().unwrap();
        let v = &state.tools["jq"].versions["1.7.1"];
        assert_eq!(v.requested, "1.7");
        assert_eq!(v.install_hash.as_deref(), Some("blake3:tree"));
    }

    #[test]
    fn test_atomic_write_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        store.store_plan(&plan("a", "1"), "").unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_concurrent_updates_keep_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));

        std::thread::scope(|scope| {
            for i in 0..8 {
                let store = &store;
                scope.spawn(move || {
                    for j in 0..5 {
                        store
                            .record_install(&plan(&format!("tool{}", i), &format!("1.{}", j)), "latest", None)
                            .unwrap();
                    }
                });
            }
        });

        let state = store.load().unwrap();
        assert_eq!(state.tools.len(), 8);
        for tool in state.tools.values() {
            assert_eq!(tool.versions.len(), 5);
        }
        assert!(dir.path().join("state.json.lock").exists());
    }

    #[test]
    fn test_roundtrip_preserves_tool_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        store.store_plan(&plan("zeta", "1"), "").unwrap();
        store.store_plan(&plan("alpha", "1"), "").unwrap();
        let state = store.load().unwrap();
        let keys: Vec<_> = state.tools.keys().collect();
        assert_eq!(keys, vec!["zeta", "alpha"]);
    }
}
