//! Actions: the units of work a recipe step names.
//!
//! Every action is executable. Some are also decomposable: at plan time they
//! expand into primitive steps so the plan only ever contains actions whose
//! inputs can be pinned. The registry is an explicit object; nothing here is
//! global.

pub mod builtin;
pub mod cache;
pub mod composite;
pub mod download;
pub mod ecosystem;
pub mod extract;

use crate::core::error::{Error, Result};
use crate::core::types::{param_str, value_to_string, Params, Platform};
use async_trait::async_trait;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use self::cache::DownloadCache;
use self::download::Downloader;
use crate::tripwire::eventlog::EventLog;

// ============================================================================
// Dependency metadata
// ============================================================================

/// Tools an action needs, split by when they are needed and where.
///
/// The platform lists are additive: on Linux the install-time set is
/// `install_time + linux_install_time`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionDeps {
    pub install_time: Vec<String>,
    pub runtime: Vec<String>,
    /// Needed while a plan is generated, before anything is installed
    pub eval_time: Vec<String>,
    pub linux_install_time: Vec<String>,
    pub darwin_install_time: Vec<String>,
    pub linux_runtime: Vec<String>,
    pub darwin_runtime: Vec<String>,
}

impl ActionDeps {
    /// Install-time deps for `os`; `None` or an unknown OS gets the
    /// cross-platform list only.
    pub fn install_for(&self, os: Option<&str>) -> Vec<String> {
        let mut deps = self.install_time.clone();
        match os {
            Some("linux") => deps.extend(self.linux_install_time.iter().cloned()),
            Some("darwin") => deps.extend(self.darwin_install_time.iter().cloned()),
            _ => {}
        }
        deps
    }

    pub fn runtime_for(&self, os: Option<&str>) -> Vec<String> {
        let mut deps = self.runtime.clone();
        match os {
            Some("linux") => deps.extend(self.linux_runtime.iter().cloned()),
            Some("darwin") => deps.extend(self.darwin_runtime.iter().cloned()),
            _ => {}
        }
        deps
    }
}

// ============================================================================
// Contexts
// ============================================================================

/// Inputs available while turning a recipe step into primitives.
#[derive(Debug, Clone)]
pub struct EvalContext {
    pub version: String,
    pub version_tag: String,
    pub platform: Platform,
}

impl EvalContext {
    /// Template variables for one step, after `os_mapping`/`arch_mapping`.
    pub fn vars_for(&self, params: &Params) -> BTreeMap<String, String> {
        let mut os = self.platform.os.clone();
        let mut arch = self.platform.arch.clone();
        if let Some(mapped) = params
            .get("os_mapping")
            .and_then(|m| m.get(&self.platform.os))
            .and_then(|v| v.as_str())
        {
            os = mapped.to_string();
        }
        if let Some(mapped) = params
            .get("arch_mapping")
            .and_then(|m| m.get(&self.platform.arch))
            .and_then(|v| v.as_str())
        {
            arch = mapped.to_string();
        }

        let mut vars = BTreeMap::new();
        vars.insert("version".to_string(), self.version.clone());
        vars.insert("version_tag".to_string(), self.version_tag.clone());
        vars.insert("os".to_string(), os);
        vars.insert("arch".to_string(), arch);
        vars
    }
}

/// Everything an executing action may touch.
#[derive(Clone)]
pub struct ExecutionContext {
    pub tool: String,
    pub version: String,
    pub version_tag: String,
    pub platform: Platform,

    /// Scratch directory for downloads and extraction
    pub work_dir: PathBuf,

    /// Final location, `tools/{tool}-{version}`
    pub install_dir: PathBuf,

    /// `bin/` directories of installed dependencies, prepended to PATH
    pub exec_paths: Vec<PathBuf>,

    pub downloader: Arc<dyn Downloader>,
    pub download_cache: Option<DownloadCache>,
    pub events: Option<EventLog>,
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    /// Evaluation inputs matching this execution, for composites run
    /// outside a plan.
    pub fn eval_context(&self) -> EvalContext {
        EvalContext {
            version: self.version.clone(),
            version_tag: self.version_tag.clone(),
            platform: self.platform.clone(),
        }
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.install_dir.join("bin")
    }

    /// PATH with dependency bins and this tool's bin in front.
    pub fn search_path(&self) -> String {
        let mut parts: Vec<String> = self
            .exec_paths
            .iter()
            .chain(std::iter::once(&self.bin_dir()))
            .map(|p| p.display().to_string())
            .collect();
        if let Ok(existing) = std::env::var("PATH") {
            parts.push(existing);
        }
        parts.join(":")
    }
}

// ============================================================================
// Action traits
// ============================================================================

/// A primitive produced by decomposition, optionally carrying a known
/// checksum for download steps.
#[derive(Debug, Clone, PartialEq)]
pub struct DecomposedStep {
    pub action: String,
    pub params: Params,
    pub checksum: Option<String>,
    pub size: Option<u64>,
}

impl DecomposedStep {
    pub fn new(action: &str, params: Params) -> Self {
        Self {
            action: action.to_string(),
            params,
            checksum: None,
            size: None,
        }
    }
}

/// Composite actions that expand into other actions at plan time.
pub trait Decomposable: Send + Sync {
    fn decompose(&self, ctx: &EvalContext, params: &Params) -> Result<Vec<DecomposedStep>>;
}

#[async_trait]
pub trait Action: Send + Sync {
    fn name(&self) -> &'static str;

    fn dependencies(&self) -> ActionDeps {
        ActionDeps::default()
    }

    /// Same inputs always produce the same installed bytes.
    fn is_deterministic(&self) -> bool {
        false
    }

    /// Outputs can be pinned at plan time.
    fn is_evaluable(&self) -> bool {
        false
    }

    /// Fetches a URL; the executor verifies these against the plan checksum.
    fn is_download(&self) -> bool {
        false
    }

    /// Reject malformed params before any step runs.
    fn validate_params(&self, _params: &Params) -> Result<()> {
        Ok(())
    }

    fn as_decomposable(&self) -> Option<&dyn Decomposable> {
        None
    }

    async fn execute(&self, ctx: &ExecutionContext, params: &Params) -> Result<()>;
}

/// Require a string param or fail with an action error.
pub fn required_str<'a>(action: &str, params: &'a Params, key: &str) -> Result<&'a str> {
    param_str(params, key)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::action(action, format!("missing required param '{}'", key)))
}

// ============================================================================
// Registry
// ============================================================================

/// Name → action lookup. Built once, passed by reference.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: FxHashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every action this crate ships.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        builtin::register(&mut registry);
        composite::register(&mut registry);
        ecosystem::register(&mut registry);
        registry
    }

    pub fn register(&mut self, action: Arc<dyn Action>) {
        self.actions.insert(action.name().to_string(), action);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Action> {
        self.actions.get(name).map(|a| a.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Declared dependencies; unknown actions declare none.
    pub fn dependencies(&self, name: &str) -> ActionDeps {
        self.get(name).map(|a| a.dependencies()).unwrap_or_default()
    }

    pub fn is_evaluable(&self, name: &str) -> bool {
        self.get(name).is_some_and(|a| a.is_evaluable())
    }

    pub fn is_deterministic(&self, name: &str) -> bool {
        self.get(name).is_some_and(|a| a.is_deterministic())
    }

}

// ============================================================================
// Decomposition and templates
// ============================================================================

/// Expand an action into primitives, recursing through nested composites.
/// Revisiting the same (action, params) pair is a cycle.
pub fn decompose_to_primitives(
    registry: &ActionRegistry,
    ctx: &EvalContext,
    action: &str,
    params: &Params,
) -> Result<Vec<DecomposedStep>> {
    let mut visited = FxHashSet::default();
    decompose_inner(registry, ctx, action, params, &mut visited)
}

fn decompose_inner(
    registry: &ActionRegistry,
    ctx: &EvalContext,
    action: &str,
    params: &Params,
    visited: &mut FxHashSet<String>,
) -> Result<Vec<DecomposedStep>> {
    let act = registry
        .get(action)
        .ok_or_else(|| Error::UnknownAction(action.to_string()))?;
    let Some(decomposable) = act.as_decomposable() else {
        return Ok(vec![DecomposedStep::new(action, params.clone())]);
    };

    if !visited.insert(step_hash(action, params)) {
        return Err(Error::action(
            action,
            "decomposition cycle: action was already expanded in this chain",
        ));
    }

    let mut primitives = Vec::new();
    for step in decomposable.decompose(ctx, params)? {
        let mut sub = decompose_inner(registry, ctx, &step.action, &step.params, visited)?;
        if sub.len() == 1 && step.checksum.is_some() {
            sub[0].checksum = step.checksum.clone();
            sub[0].size = step.size;
        }
        primitives.extend(sub);
    }
    Ok(primitives)
}

fn step_hash(action: &str, params: &Params) -> String {
    let encoded = serde_json::to_string(params).unwrap_or_default();
    crate::tripwire::hasher::hash_string(&format!("{}:{}", action, encoded))
}

/// Replace `{name}` placeholders. Unknown placeholders are left as written.
pub fn expand_vars(template: &str, vars: &BTreeMap<String, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{}}}", key), value);
    }
    out
}

/// Expand templates in every string inside `params`, at any nesting depth.
/// Mapping tables are left untouched.
pub fn expand_params(params: &Params, vars: &BTreeMap<String, String>) -> Params {
    params
        .iter()
        .map(|(k, v)| {
            let value = if k == "os_mapping" || k == "arch_mapping" {
                v.clone()
            } else {
                expand_value(v, vars)
            };
            (k.clone(), value)
        })
        .collect()
}

fn expand_value(value: &serde_json::Value, vars: &BTreeMap<String, String>) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(expand_vars(s, vars)),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(|v| expand_value(v, vars)).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), expand_value(v, vars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// File name a download lands under: the `dest` param, else the URL's last
/// path segment.
pub fn download_file_name(params: &Params, url: &str) -> String {
    if let Some(dest) = param_str(params, "dest").filter(|d| !d.is_empty()) {
        return dest.to_string();
    }
    let trimmed = url.split(['?', '#']).next().unwrap_or(url);
    trimmed
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or("download")
        .to_string()
}

/// Params as display text, for logs.
pub fn describe_params(params: &Params) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, value_to_string(v)))
        .collect::<Vec<_>>()
        .join(" ")
}
