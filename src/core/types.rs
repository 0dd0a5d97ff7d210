//! Recipe, dependency, plan, and state types.
//!
//! Recipes are TOML documents; plans and state are JSON. Every type derives
//! Serialize/Deserialize so plans can be written to disk and replayed.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Dynamic step parameters, exactly as written in the recipe.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Current serialized plan layout. Readers reject any other value.
pub const PLAN_FORMAT_VERSION: u32 = 2;

// ============================================================================
// Platform
// ============================================================================

/// Target operating system and architecture, in Go-style naming
/// (`linux`/`darwin`, `amd64`/`arm64`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: normalize_os(&os.into()),
            arch: normalize_arch(&arch.into()),
        }
    }

    /// The platform this binary is running on.
    pub fn host() -> Self {
        Self::new(std::env::consts::OS, std::env::consts::ARCH)
    }

    /// `"os-arch"`, the form used in cache keys.
    pub fn key(&self) -> String {
        format!("{}-{}", self.os, self.arch)
    }

    /// `"os/arch"`, the form used in `when.platform` guards.
    pub fn tuple(&self) -> String {
        format!("{}/{}", self.os, self.arch)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

pub fn normalize_os(os: &str) -> String {
    match os {
        "macos" | "osx" => "darwin".to_string(),
        other => other.to_string(),
    }
}

pub fn normalize_arch(arch: &str) -> String {
    match arch {
        "x86_64" => "amd64".to_string(),
        "aarch64" => "arm64".to_string(),
        other => other.to_string(),
    }
}

// ============================================================================
// Recipe
// ============================================================================

/// A parsed recipe: metadata, version source, ordered steps, verification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Recipe {
    pub metadata: Metadata,

    #[serde(default)]
    pub version: VersionSection,

    #[serde(default)]
    pub steps: Vec<Step>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<VerifySection>,
}

impl Recipe {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    /// Tool name; also the key recipe loaders look it up by
    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,

    #[serde(default, rename = "type")]
    pub recipe_type: RecipeType,

    /// Replaces the aggregated install-time set when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Vec<String>>,

    /// Replaces the aggregated runtime set when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_dependencies: Option<Vec<String>>,

    /// Added to the install-time set after any replacement
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_dependencies: Vec<String>,

    /// Added to the runtime set after any replacement
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_runtime_dependencies: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supported_os: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supported_arch: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipeType {
    #[default]
    Tool,
    Library,
}

impl fmt::Display for RecipeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecipeType::Tool => write!(f, "tool"),
            RecipeType::Library => write!(f, "library"),
        }
    }
}

/// Where concrete versions come from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionSection {
    /// `github_releases` or `static`; inferred when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// `owner/repo` for the GitHub releases source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_repo: Option<String>,

    /// Prefix stripped from tags (`v` in `v1.2.3`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag_prefix: Option<String>,

    /// Known versions for the static source, any order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub versions: Vec<String>,
}

/// Post-install check: run `command`, expect `pattern` in its output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifySection {
    pub command: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

/// One recipe step. Everything except the named fields lands in `params`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Step {
    pub action: String,

    #[serde(default, skip_serializing_if = "WhenClause::is_empty")]
    pub when: WhenClause,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(flatten)]
    pub params: Params,
}

impl Step {
    pub fn new(action: &str) -> Self {
        Self {
            action: action.to_string(),
            ..Self::default()
        }
    }

    /// Builder-style param insertion, mostly for tests and decomposition.
    pub fn with_param(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// Typed view of the dependency override keys in `params`.
    pub fn overrides(&self) -> StepOverrides {
        StepOverrides::from_params(&self.params)
    }
}

/// Platform guard on a step. Empty means "always".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhenClause {
    /// Exact `os/arch` tuples; takes precedence over `os`/`arch`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub platform: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub os: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
}

impl WhenClause {
    pub fn is_empty(&self) -> bool {
        self.platform.is_empty() && self.os.is_empty() && self.arch.is_none()
    }

    pub fn matches(&self, platform: &Platform) -> bool {
        if !self.platform.is_empty() {
            let tuple = platform.tuple();
            return self.platform.iter().any(|p| *p == tuple);
        }
        if !self.os.is_empty() && !self.os.iter().any(|o| *o == platform.os) {
            return false;
        }
        match &self.arch {
            Some(arch) => *arch == platform.arch,
            None => true,
        }
    }
}

/// Step-local dependency overrides.
///
/// `dependencies`/`runtime_dependencies` replace the action's implicit set
/// for the step; the `extra_*` lists extend it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepOverrides {
    pub dependencies: Option<Vec<String>>,
    pub runtime_dependencies: Option<Vec<String>>,
    pub extra_dependencies: Vec<String>,
    pub extra_runtime_dependencies: Vec<String>,
}

impl StepOverrides {
    pub fn from_params(params: &Params) -> Self {
        Self {
            dependencies: param_string_list(params, "dependencies"),
            runtime_dependencies: param_string_list(params, "runtime_dependencies"),
            extra_dependencies: param_string_list(params, "extra_dependencies")
                .unwrap_or_default(),
            extra_runtime_dependencies: param_string_list(params, "extra_runtime_dependencies")
                .unwrap_or_default(),
        }
    }
}

/// Read a string param.
pub fn param_str<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

/// Read a param that may be a single string or a list of strings.
/// Non-string list entries are skipped.
pub fn param_string_list(params: &Params, key: &str) -> Option<Vec<String>> {
    match params.get(key)? {
        serde_json::Value::String(s) => Some(vec![s.clone()]),
        serde_json::Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
        ),
        _ => None,
    }
}

/// Render a param value as plain text for templates and shell commands.
pub fn value_to_string(val: &serde_json::Value) -> String {
    match val {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

// ============================================================================
// Dependencies
// ============================================================================

/// Tool dependencies split by timing: name → version (`"latest"` if unpinned).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedDeps {
    pub install_time: BTreeMap<String, String>,
    pub runtime: BTreeMap<String, String>,
}

impl ResolvedDeps {
    pub fn is_empty(&self) -> bool {
        self.install_time.is_empty() && self.runtime.is_empty()
    }
}

// ============================================================================
// Installation plans
// ============================================================================

/// A fully resolved, replayable installation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallationPlan {
    pub format_version: u32,
    pub tool: String,
    pub version: String,
    pub platform: Platform,
    pub generated_at: DateTime<Utc>,

    /// BLAKE3 of the canonical recipe encoding
    pub recipe_hash: String,

    /// Where the recipe was loaded from (`embedded`, a path, `memory`)
    pub recipe_source: String,

    #[serde(default)]
    pub recipe_type: RecipeType,

    /// True iff every step is deterministic
    pub deterministic: bool,

    pub steps: Vec<ResolvedStep>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<VerifySection>,
}

/// A primitive step with frozen parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedStep {
    pub action: String,
    pub params: Params,
    pub evaluable: bool,

    #[serde(default)]
    pub deterministic: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// `sha256` hex digest, lowercase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

// ============================================================================
// Persisted state
// ============================================================================

/// Root of `state.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub tools: IndexMap<String, ToolState>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_version: Option<String>,

    #[serde(default)]
    pub versions: IndexMap<String, VersionState>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionState {
    /// Constraint the user asked for (`""`, `"latest"`, `"1.2"`, ...)
    #[serde(default)]
    pub requested: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_at: Option<DateTime<Utc>>,

    /// BLAKE3 over the installed tree, for later integrity checks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_hash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<InstallationPlan>,
}

// ============================================================================
// Provenance events
// ============================================================================

/// Provenance event types for the JSONL log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProvenanceEvent {
    PlanGenerated {
        tool: String,
        version: String,
        platform: String,
        recipe_hash: String,
        steps: usize,
    },
    PlanCacheHit {
        tool: String,
        version: String,
        platform: String,
    },
    StepCompleted {
        tool: String,
        index: usize,
        action: String,
        duration_seconds: f64,
    },
    ChecksumVerified {
        tool: String,
        url: String,
        checksum: String,
    },
    ChecksumMismatch {
        tool: String,
        url: String,
        expected: String,
        actual: String,
    },
    InstallCompleted {
        tool: String,
        version: String,
        total_seconds: f64,
    },
}

/// Timestamped event wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimestampedEvent {
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub event: ProvenanceEvent,
}

// ============================================================================
// Tests
// ============================================================================
