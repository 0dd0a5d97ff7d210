//! Settings: where kura keeps tools, caches, recipes, and state.
//!
//! Everything lives under `$KURA_HOME` (default `~/.kura`). An optional
//! `$KURA_HOME/config.toml` can relocate individual directories; relative
//! paths in it are taken relative to the home directory.

use super::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_GITHUB_API: &str = "https://api.github.com";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub home: PathBuf,
    pub recipes_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub tools_dir: PathBuf,
    pub state_file: PathBuf,
    pub events_file: PathBuf,
    pub github_api: String,
    pub github_token: Option<String>,
}

/// On-disk overrides. Unknown keys are rejected so typos surface.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    recipes_dir: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    tools_dir: Option<PathBuf>,
    state_file: Option<PathBuf>,
    github_api: Option<String>,
}

impl Settings {
    /// Resolve from the environment: `KURA_HOME`, `GITHUB_TOKEN`, then
    /// `config.toml` if present.
    pub fn load() -> Result<Self> {
        let home = match std::env::var_os("KURA_HOME") {
            Some(h) if !h.is_empty() => PathBuf::from(h),
            _ => dirs::home_dir()
                .map(|h| h.join(".kura"))
                .ok_or_else(|| {
                    Error::Config("cannot determine home directory; set KURA_HOME".into())
                })?,
        };
        let mut settings = Self::from_home(&home)?;
        settings.github_token = std::env::var("GITHUB_TOKEN").ok().filter(|t| !t.is_empty());
        Ok(settings)
    }

    /// Defaults under `home`, then any `config.toml` overrides.
    pub fn from_home(home: &Path) -> Result<Self> {
        let mut settings = Self::with_home(home);
        let config_path = home.join("config.toml");
        if config_path.exists() {
            let content =
                std::fs::read_to_string(&config_path).map_err(|e| Error::io(&config_path, e))?;
            let file: ConfigFile = toml::from_str(&content).map_err(|e| {
                Error::Config(format!("{}: {}", config_path.display(), e))
            })?;
            settings.apply(file);
        }
        Ok(settings)
    }

    /// Defaults only; no files are read.
    pub fn with_home(home: &Path) -> Self {
        Self {
            home: home.to_path_buf(),
            recipes_dir: home.join("recipes"),
            cache_dir: home.join("cache").join("downloads"),
            tools_dir: home.join("tools"),
            state_file: home.join("state.json"),
            events_file: home.join("events.jsonl"),
            github_api: DEFAULT_GITHUB_API.to_string(),
            github_token: None,
        }
    }

    fn apply(&mut self, file: ConfigFile) {
        let home = self.home.clone();
        let rooted = |p: PathBuf| if p.is_absolute() { p } else { home.join(p) };
        if let Some(p) = file.recipes_dir {
            self.recipes_dir = rooted(p);
        }
        if let Some(p) = file.cache_dir {
            self.cache_dir = rooted(p);
        }
        if let Some(p) = file.tools_dir {
            self.tools_dir = rooted(p);
        }
        if let Some(p) = file.state_file {
            self.state_file = rooted(p);
        }
        if let Some(api) = file.github_api {
            self.github_api = api.trim_end_matches('/').to_string();
        }
    }

    /// `tools/{tool}-{version}`
    pub fn install_dir(&self, tool: &str, version: &str) -> PathBuf {
        self.tools_dir.join(format!("{}-{}", tool, version))
    }

    /// Scratch space for one install, removed afterwards.
    pub fn work_dir(&self, tool: &str, version: &str) -> PathBuf {
        self.home.join("work").join(format!("{}-{}", tool, version))
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.recipes_dir, &self.cache_dir, &self.tools_dir] {
            std::fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
        }
        Ok(())
    }
}
