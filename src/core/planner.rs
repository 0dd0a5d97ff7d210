//! Plan generation.
//!
//! Phase 1 resolves the version constraint to a concrete version. Phase 2
//! walks the recipe's steps for the target platform, decomposes composites
//! into primitives, and pins every download to a SHA-256 checksum, fetching
//! the artifact when the recipe does not declare one.

use super::error::{Error, Result};
use super::plan_cache::{self, PlanCacheKey, PlanStore};
use super::recipe::LoadedRecipe;
use super::types::{
    param_str, InstallationPlan, Params, Platform, ProvenanceEvent, Recipe, ResolvedStep,
    PLAN_FORMAT_VERSION,
};
use super::version::{VersionInfo, VersionResolver};
use crate::actions::builtin::resolve_under;
use crate::actions::cache::DownloadCache;
use crate::actions::download::{normalize_checksum, Downloader};
use crate::actions::{
    decompose_to_primitives, download_file_name, expand_params, ActionRegistry, DecomposedStep,
    EvalContext,
};
use crate::tripwire::eventlog::{self, EventLog};
use crate::tripwire::hasher;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Builds installation plans. Borrowed collaborators, owned handles.
pub struct Planner<'a> {
    registry: &'a ActionRegistry,
    versions: &'a dyn VersionResolver,
    downloader: Arc<dyn Downloader>,
    /// Where Phase 2 fetches artifacts it has to hash
    scratch_dir: PathBuf,
    download_cache: Option<DownloadCache>,
    store: Option<&'a dyn PlanStore>,
    events: Option<EventLog>,
    /// Whether a tool an action needs while planning is available
    eval_check: Option<Box<dyn Fn(&str) -> bool + Send + Sync + 'a>>,
}

impl<'a> Planner<'a> {
    pub fn new(
        registry: &'a ActionRegistry,
        versions: &'a dyn VersionResolver,
        downloader: Arc<dyn Downloader>,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            versions,
            downloader,
            scratch_dir: scratch_dir.into(),
            download_cache: None,
            store: None,
            events: None,
            eval_check: None,
        }
    }

    pub fn with_cache(mut self, cache: DownloadCache) -> Self {
        self.download_cache = Some(cache);
        self
    }

    pub fn with_store(mut self, store: &'a dyn PlanStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Plans for foreign platforms must not replace the host's cached plan.
    pub fn without_store(mut self) -> Self {
        self.store = None;
        self
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    /// Refuse steps whose eval-time dependencies `available` rejects.
    /// Without a check, eval-time dependencies are not enforced.
    pub fn with_eval_check(mut self, available: impl Fn(&str) -> bool + Send + Sync + 'a) -> Self {
        self.eval_check = Some(Box::new(available));
        self
    }

    /// Phase 1. Any failure other than cancellation degrades to a
    /// placeholder version with a warning: the explicit constraint when
    /// the recipe has no version source, `dev` otherwise.
    pub async fn resolve_version(
        &self,
        recipe: &Recipe,
        constraint: &str,
        cancel: &CancellationToken,
    ) -> Result<VersionInfo> {
        match self.versions.resolve(recipe, constraint, cancel).await {
            Ok(info) => Ok(info),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                let explicit = !constraint.is_empty() && constraint != "latest";
                let fallback = if explicit && !has_version_source(recipe) {
                    VersionInfo::new(constraint, constraint)
                } else {
                    VersionInfo::dev()
                };
                tracing::warn!(
                    tool = recipe.name(),
                    constraint,
                    error = %e,
                    fallback = %fallback.version,
                    "version resolution failed"
                );
                Ok(fallback)
            }
        }
    }

    /// Resolve, reuse a valid cached plan unless `fresh`, otherwise
    /// generate and store.
    pub async fn get_or_generate(
        &self,
        loaded: &LoadedRecipe,
        constraint: &str,
        platform: &Platform,
        fresh: bool,
        cancel: &CancellationToken,
    ) -> Result<InstallationPlan> {
        let recipe = &loaded.recipe;
        let version = self.resolve_version(recipe, constraint, cancel).await?;
        let recipe_hash = hasher::recipe_hash(recipe)?;
        let key = PlanCacheKey::new(recipe.name(), &version.version, platform, &recipe_hash);

        if let Some(store) = self.store {
            if !fresh {
                if let Some(plan) = plan_cache::lookup(store, &key)? {
                    tracing::info!(key = %key, "reusing cached plan");
                    eventlog::record(
                        self.events.as_ref(),
                        ProvenanceEvent::PlanCacheHit {
                            tool: plan.tool.clone(),
                            version: plan.version.clone(),
                            platform: plan.platform.key(),
                        },
                    );
                    return Ok(plan);
                }
            }
        }

        let plan = self.generate(loaded, &version, platform, cancel).await?;
        if let Some(store) = self.store {
            store.put_plan(&plan, constraint)?;
        }
        Ok(plan)
    }

    /// Phase 2: build the plan for one concrete version.
    pub async fn generate(
        &self,
        loaded: &LoadedRecipe,
        version: &VersionInfo,
        platform: &Platform,
        cancel: &CancellationToken,
    ) -> Result<InstallationPlan> {
        let recipe = &loaded.recipe;
        let tool = recipe.name();
        check_supported(recipe, platform)?;

        let eval = EvalContext {
            version: version.version.clone(),
            version_tag: version.tag.clone(),
            platform: platform.clone(),
        };

        let mut steps = Vec::new();
        for step in &recipe.steps {
            if !step.when.matches(platform) {
                tracing::debug!(tool, action = %step.action, %platform, "step skipped for platform");
                continue;
            }
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            if !self.registry.contains(&step.action) {
                tracing::warn!(tool, action = %step.action, "unknown action kept as non-evaluable");
                steps.push(ResolvedStep {
                    action: step.action.clone(),
                    params: freeze(&step.params, &eval),
                    evaluable: false,
                    deterministic: false,
                    url: None,
                    checksum: None,
                    size: None,
                });
                continue;
            }

            self.check_eval_deps(tool, &step.action)?;
            for primitive in decompose_to_primitives(self.registry, &eval, &step.action, &step.params)? {
                let resolved = self.resolve_primitive(tool, primitive, &eval, cancel).await?;
                if !resolved.evaluable {
                    tracing::warn!(
                        tool,
                        action = %resolved.action,
                        "step cannot be pinned; plan is not reproducible"
                    );
                }
                steps.push(resolved);
            }
        }

        let plan = InstallationPlan {
            format_version: PLAN_FORMAT_VERSION,
            tool: tool.to_string(),
            version: version.version.clone(),
            platform: platform.clone(),
            generated_at: Utc::now(),
            recipe_hash: hasher::recipe_hash(recipe)?,
            recipe_source: loaded.source.clone(),
            recipe_type: recipe.metadata.recipe_type,
            deterministic: steps.iter().all(|s| s.deterministic),
            steps,
            verify: recipe.verify.clone(),
        };

        tracing::info!(
            tool,
            version = %plan.version,
            %platform,
            steps = plan.steps.len(),
            deterministic = plan.deterministic,
            "plan generated"
        );
        eventlog::record(
            self.events.as_ref(),
            ProvenanceEvent::PlanGenerated {
                tool: plan.tool.clone(),
                version: plan.version.clone(),
                platform: platform.key(),
                recipe_hash: plan.recipe_hash.clone(),
                steps: plan.steps.len(),
            },
        );
        Ok(plan)
    }

    async fn resolve_primitive(
        &self,
        tool: &str,
        primitive: DecomposedStep,
        eval: &EvalContext,
        cancel: &CancellationToken,
    ) -> Result<ResolvedStep> {
        let params = freeze(&primitive.params, eval);
        let action = primitive.action;
        let is_download = self.registry.get(&action).is_some_and(|a| a.is_download());

        let mut resolved = ResolvedStep {
            evaluable: self.registry.is_evaluable(&action),
            deterministic: self.registry.is_deterministic(&action),
            action,
            params,
            url: None,
            checksum: None,
            size: None,
        };
        if !is_download {
            return Ok(resolved);
        }

        let url = param_str(&resolved.params, "url")
            .ok_or_else(|| Error::action(&resolved.action, "missing required param 'url'"))?
            .to_string();
        let declared = primitive
            .checksum
            .or_else(|| param_str(&resolved.params, "checksum").map(str::to_string))
            .map(|c| normalize_checksum(&c))
            .filter(|c| !c.is_empty());

        match declared {
            Some(checksum) => {
                resolved.checksum = Some(checksum);
                resolved.size = primitive.size;
            }
            None => {
                let (checksum, size) = self.fetch_checksum(tool, &url, &resolved.params, cancel).await?;
                resolved.checksum = Some(checksum);
                resolved.size = Some(size);
            }
        }
        resolved.url = Some(url);
        Ok(resolved)
    }

    fn check_eval_deps(&self, tool: &str, action: &str) -> Result<()> {
        let Some(available) = &self.eval_check else {
            return Ok(());
        };
        let missing: Vec<String> = self
            .registry
            .dependencies(action)
            .eval_time
            .into_iter()
            .filter(|dep| !available(dep))
            .collect();
        match missing.first() {
            None => Ok(()),
            Some(first) => Err(Error::recipe(
                tool,
                format!(
                    "missing eval-time dependencies: {} (install with: kura install {})",
                    missing.join(", "),
                    first
                ),
            )),
        }
    }

    /// Hash an artifact the recipe did not pin. The artifact is always
    /// fetched, so a regenerated plan pins what upstream serves now; the
    /// download cache only receives the bytes.
    async fn fetch_checksum(
        &self,
        tool: &str,
        url: &str,
        params: &Params,
        cancel: &CancellationToken,
    ) -> Result<(String, u64)> {
        std::fs::create_dir_all(&self.scratch_dir).map_err(|e| Error::io(&self.scratch_dir, e))?;
        // Private per download; concurrent planners share scratch_dir
        let scratch = tempfile::Builder::new()
            .prefix("plan-")
            .tempdir_in(&self.scratch_dir)
            .map_err(|e| Error::io(&self.scratch_dir, e))?;
        let dest = resolve_under(scratch.path(), &download_file_name(params, url), "download")?;

        tracing::info!(tool, url, "downloading to compute checksum");
        let outcome = self.downloader.download(url, &dest, cancel).await?;
        if let Some(cache) = &self.download_cache {
            if let Err(e) = cache.save(url, &outcome.path, Some(&outcome.checksum)) {
                tracing::warn!(url, error = %e, "cannot populate download cache");
            }
        }
        Ok((outcome.checksum, outcome.size))
    }
}

/// Expand templates and drop the mapping tables they were read through.
fn freeze(params: &Params, eval: &EvalContext) -> Params {
    let mut frozen = expand_params(params, &eval.vars_for(params));
    frozen.remove("os_mapping");
    frozen.remove("arch_mapping");
    frozen
}

fn has_version_source(recipe: &Recipe) -> bool {
    let v = &recipe.version;
    v.source.is_some() || v.github_repo.is_some() || !v.versions.is_empty()
}

fn check_supported(recipe: &Recipe, platform: &Platform) -> Result<()> {
    let meta = &recipe.metadata;
    if !meta.supported_os.is_empty() && !meta.supported_os.iter().any(|o| *o == platform.os) {
        return Err(Error::recipe(
            recipe.name(),
            format!("not supported on {} (supports {})", platform.os, meta.supported_os.join(", ")),
        ));
    }
    if !meta.supported_arch.is_empty() && !meta.supported_arch.iter().any(|a| *a == platform.arch) {
        return Err(Error::recipe(
            recipe.name(),
            format!(
                "not supported on {} (supports {})",
                platform.arch,
                meta.supported_arch.join(", ")
            ),
        ));
    }
    Ok(())
}
