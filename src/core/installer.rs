//! Installs a tool and everything it needs.
//!
//! Resolution runs for the host platform. Install-time and runtime
//! dependencies are installed first, in dependency order, then the tool
//! itself. Each install goes plan → execute → record.

use super::config::Settings;
use super::error::{Error, Result};
use super::executor;
use super::planner::Planner;
use super::recipe::{EmbeddedLoader, LoadedRecipe, RecipeLoader};
use super::resolver::{
    install_graph, install_order, resolve_dependencies_for_platform,
    resolve_transitive_for_platform,
};
use super::state::StateStore;
use super::types::{InstallationPlan, Platform, ProvenanceEvent, ResolvedDeps};
use super::version::VersionResolver;
use crate::actions::cache::DownloadCache;
use crate::actions::download::Downloader;
use crate::actions::{ActionRegistry, ExecutionContext};
use crate::tripwire::eventlog::{self, EventLog};
use crate::tripwire::hasher;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Default)]
pub struct InstallOptions {
    /// Ignore cached plans and re-resolve
    pub fresh: bool,
    /// Dependencies must come from the recipes compiled into the binary
    pub require_embedded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    pub tool: String,
    pub version: String,
    pub install_dir: PathBuf,
    /// Dependencies installed by this call, in install order
    pub installed_dependencies: Vec<String>,
    pub already_installed: bool,
}

pub struct Installer {
    settings: Settings,
    registry: ActionRegistry,
    loader: Box<dyn RecipeLoader>,
    versions: Box<dyn VersionResolver>,
    downloader: Arc<dyn Downloader>,
    state: StateStore,
    events: EventLog,
    cache: DownloadCache,
}

impl Installer {
    pub fn new(
        settings: Settings,
        loader: Box<dyn RecipeLoader>,
        versions: Box<dyn VersionResolver>,
        downloader: Arc<dyn Downloader>,
    ) -> Self {
        Self {
            registry: ActionRegistry::builtin(),
            state: StateStore::new(&settings.state_file),
            events: EventLog::new(&settings.events_file),
            cache: DownloadCache::new(&settings.cache_dir),
            settings,
            loader,
            versions,
            downloader,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn cache(&self) -> &DownloadCache {
        &self.cache
    }

    pub fn planner(&self) -> Planner<'_> {
        let state = &self.state;
        Planner::new(
            &self.registry,
            self.versions.as_ref(),
            self.downloader.clone(),
            self.settings.home.join("work").join("plan"),
        )
        .with_cache(self.cache.clone())
        .with_store(&self.state)
        .with_events(self.events.clone())
        .with_eval_check(move |tool| {
            state.installed_version(tool).ok().flatten().is_some() || on_path(tool)
        })
    }

    fn locate(&self, loader: &dyn RecipeLoader, name: &str) -> Result<LoadedRecipe> {
        loader
            .locate(name)?
            .ok_or_else(|| Error::recipe(name, "no recipe found"))
    }

    /// The tool's own declarations, filtered for `os`.
    pub fn direct_dependencies(&self, tool: &str, os: Option<&str>) -> Result<ResolvedDeps> {
        let root = self.locate(self.loader.as_ref(), tool)?;
        Ok(resolve_dependencies_for_platform(&root.recipe, &self.registry, os))
    }

    /// Transitive dependencies of `tool`, filtered for `os`.
    pub fn dependencies(&self, tool: &str, os: Option<&str>, cancel: &CancellationToken) -> Result<ResolvedDeps> {
        let root = self.locate(self.loader.as_ref(), tool)?;
        let direct = resolve_dependencies_for_platform(&root.recipe, &self.registry, os);
        resolve_transitive_for_platform(self.loader.as_ref(), &self.registry, &direct, tool, os, cancel)
    }

    /// Plan for any platform. Plans for the host are cached in state.
    pub async fn plan(
        &self,
        tool: &str,
        constraint: &str,
        platform: &Platform,
        fresh: bool,
        cancel: &CancellationToken,
    ) -> Result<InstallationPlan> {
        let loaded = self.locate(self.loader.as_ref(), tool)?;
        let planner = if *platform == Platform::host() {
            self.planner()
        } else {
            self.planner().without_store()
        };
        planner
            .get_or_generate(&loaded, constraint, platform, fresh, cancel)
            .await
    }

    pub async fn install(
        &self,
        tool: &str,
        constraint: &str,
        opts: InstallOptions,
        cancel: &CancellationToken,
    ) -> Result<InstallOutcome> {
        let host = Platform::host();
        let os = Some(host.os.as_str());
        let root = self.locate(self.loader.as_ref(), tool)?;

        let dep_loader: &dyn RecipeLoader = if opts.require_embedded {
            &EmbeddedLoader
        } else {
            self.loader.as_ref()
        };
        let direct = resolve_dependencies_for_platform(&root.recipe, &self.registry, os);
        let closure = resolve_transitive_for_platform(dep_loader, &self.registry, &direct, tool, os, cancel)?;

        // Runtime deps must be present too; install-time pins win on overlap
        let mut wanted = closure.install_time.clone();
        for (name, version) in &closure.runtime {
            wanted.entry(name.clone()).or_insert_with(|| version.clone());
        }
        let order = install_order(&install_graph(dep_loader, &self.registry, &wanted, os)?)?;
        if !order.is_empty() {
            tracing::info!(tool, dependencies = ?order, "installing dependencies");
        }

        let mut installed = Vec::new();
        for dep in &order {
            let constraint = wanted.get(dep).map(String::as_str).unwrap_or("latest");
            if self.satisfied(dep, constraint)? {
                tracing::debug!(dep = %dep, constraint, "dependency already installed");
                continue;
            }
            let Some(loaded) = dep_loader.locate(dep)? else {
                if opts.require_embedded {
                    return Err(Error::recipe(dep, "not available as an embedded recipe"));
                }
                tracing::warn!(dep = %dep, "no recipe for dependency, assuming it is provided");
                continue;
            };
            let plan = self.planner().get_or_generate(&loaded, constraint, &host, opts.fresh, cancel).await?;
            let exec_paths = self.bin_dirs(&wanted)?;
            self.install_plan(&plan, constraint, exec_paths, cancel).await?;
            installed.push(dep.clone());
        }

        let plan = self.planner().get_or_generate(&root, constraint, &host, opts.fresh, cancel).await?;
        let install_dir = self.settings.install_dir(&plan.tool, &plan.version);
        if !opts.fresh && self.state.is_installed(&plan.tool, &plan.version)? && install_dir.exists() {
            tracing::info!(tool, version = %plan.version, "already installed");
            return Ok(InstallOutcome {
                tool: plan.tool,
                version: plan.version,
                install_dir,
                installed_dependencies: installed,
                already_installed: true,
            });
        }

        let exec_paths = self.bin_dirs(&wanted)?;
        let install_dir = self.install_plan(&plan, constraint, exec_paths, cancel).await?;
        Ok(InstallOutcome {
            tool: plan.tool,
            version: plan.version,
            install_dir,
            installed_dependencies: installed,
            already_installed: false,
        })
    }

    /// Replay a plan written by `kura plan`.
    pub async fn install_plan_file(&self, path: &Path, cancel: &CancellationToken) -> Result<InstallOutcome> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let plan: InstallationPlan = serde_json::from_str(&content)?;

        let installed: BTreeMap<String, String> = self
            .state
            .load()?
            .tools
            .into_iter()
            .filter_map(|(name, t)| t.active_version.map(|v| (name, v)))
            .collect();
        let exec_paths = self.bin_dirs(&installed)?;
        let install_dir = self.install_plan(&plan, &plan.version, exec_paths, cancel).await?;
        Ok(InstallOutcome {
            tool: plan.tool,
            version: plan.version,
            install_dir,
            installed_dependencies: Vec::new(),
            already_installed: false,
        })
    }

    /// Execute one plan and record the result. A failed first install
    /// leaves no install directory behind.
    pub async fn install_plan(
        &self,
        plan: &InstallationPlan,
        requested: &str,
        exec_paths: Vec<PathBuf>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let install_dir = self.settings.install_dir(&plan.tool, &plan.version);
        let existed = install_dir.exists();
        let ctx = ExecutionContext {
            tool: plan.tool.clone(),
            version: plan.version.clone(),
            version_tag: plan.version.clone(),
            platform: Platform::host(),
            work_dir: self.settings.work_dir(&plan.tool, &plan.version),
            install_dir: install_dir.clone(),
            exec_paths,
            downloader: self.downloader.clone(),
            download_cache: Some(self.cache.clone()),
            events: Some(self.events.clone()),
            cancel: cancel.clone(),
        };

        let started = Instant::now();
        let result = executor::execute_plan(&self.registry, plan, &ctx).await;
        let _ = std::fs::remove_dir_all(&ctx.work_dir);
        if let Err(e) = result {
            if !existed {
                let _ = std::fs::remove_dir_all(&install_dir);
            }
            return Err(e);
        }

        let install_hash = match hasher::hash_directory(&install_dir) {
            Ok(h) => Some(h),
            Err(e) => {
                tracing::warn!(dir = %install_dir.display(), error = %e, "cannot hash install");
                None
            }
        };
        self.state.record_install(plan, requested, install_hash)?;

        let total = started.elapsed().as_secs_f64();
        tracing::info!(tool = %plan.tool, version = %plan.version, seconds = total, "installed");
        eventlog::record(
            Some(&self.events),
            ProvenanceEvent::InstallCompleted {
                tool: plan.tool.clone(),
                version: plan.version.clone(),
                total_seconds: total,
            },
        );
        Ok(install_dir)
    }

    /// Whether the active version of `tool` meets `constraint`.
    fn satisfied(&self, tool: &str, constraint: &str) -> Result<bool> {
        let Some(active) = self.state.installed_version(tool)? else {
            return Ok(false);
        };
        Ok(constraint.is_empty()
            || constraint == "latest"
            || active == constraint
            || active.starts_with(&format!("{}.", constraint)))
    }

    /// `bin/` of every listed tool that has an active install.
    fn bin_dirs(&self, tools: &BTreeMap<String, String>) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        for tool in tools.keys() {
            if let Some(version) = self.state.installed_version(tool)? {
                let bin = self.settings.install_dir(tool, &version).join("bin");
                if bin.is_dir() {
                    dirs.push(bin);
                }
            }
        }
        Ok(dirs)
    }
}

fn on_path(program: &str) -> bool {
    std::env::var_os("PATH")
        .is_some_and(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
}
