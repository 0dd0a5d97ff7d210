//! Plan cache keys and the validator that guards plan reuse.
//!
//! A cached plan is reused only when its format version, platform, and
//! recipe hash all match the request. Any mismatch is a miss, never an
//! error.

use super::error::Result;
use super::types::{InstallationPlan, Platform, PLAN_FORMAT_VERSION};
use std::fmt;

/// Identity of a generated plan. The resolved version is part of the key,
/// so `latest`, `""`, and `1.2.3` share an entry once they resolve alike.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlanCacheKey {
    pub tool: String,
    pub version: String,
    /// `"os-arch"`
    pub platform: String,
    pub recipe_hash: String,
}

impl PlanCacheKey {
    pub fn new(tool: &str, version: &str, platform: &Platform, recipe_hash: &str) -> Self {
        Self {
            tool: tool.to_string(),
            version: version.to_string(),
            platform: platform.key(),
            recipe_hash: recipe_hash.to_string(),
        }
    }

    pub fn for_plan(plan: &InstallationPlan) -> Self {
        Self::new(&plan.tool, &plan.version, &plan.platform, &plan.recipe_hash)
    }
}

impl fmt::Display for PlanCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.recipe_hash.get(..19).unwrap_or(&self.recipe_hash);
        write!(f, "{}@{} ({}, {})", self.tool, self.version, self.platform, short)
    }
}

/// Why a cached plan cannot be reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidPlan {
    FormatVersion { found: u32, expected: u32 },
    Platform { cached: String, wanted: String },
    RecipeHash { cached: String, wanted: String },
    Identity { cached: String, wanted: String },
}

impl fmt::Display for InvalidPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidPlan::FormatVersion { found, expected } => {
                write!(f, "plan format {} (current is {})", found, expected)
            }
            InvalidPlan::Platform { cached, wanted } => {
                write!(f, "plan is for {}, wanted {}", cached, wanted)
            }
            InvalidPlan::RecipeHash { cached, wanted } => {
                write!(f, "recipe changed ({} → {})", cached, wanted)
            }
            InvalidPlan::Identity { cached, wanted } => {
                write!(f, "plan is for {}, wanted {}", cached, wanted)
            }
        }
    }
}

/// Check a retrieved plan against the key it was looked up under.
pub fn validate_cached_plan(
    plan: &InstallationPlan,
    key: &PlanCacheKey,
) -> std::result::Result<(), InvalidPlan> {
    if plan.format_version != PLAN_FORMAT_VERSION {
        return Err(InvalidPlan::FormatVersion {
            found: plan.format_version,
            expected: PLAN_FORMAT_VERSION,
        });
    }
    if plan.tool != key.tool || plan.version != key.version {
        return Err(InvalidPlan::Identity {
            cached: format!("{}@{}", plan.tool, plan.version),
            wanted: format!("{}@{}", key.tool, key.version),
        });
    }
    if plan.platform.key() != key.platform {
        return Err(InvalidPlan::Platform {
            cached: plan.platform.key(),
            wanted: key.platform.clone(),
        });
    }
    if plan.recipe_hash != key.recipe_hash {
        return Err(InvalidPlan::RecipeHash {
            cached: plan.recipe_hash.clone(),
            wanted: key.recipe_hash.clone(),
        });
    }
    Ok(())
}

/// Persistence for generated plans, keyed by (tool, version).
pub trait PlanStore: Send + Sync {
    fn get_plan(&self, tool: &str, version: &str) -> Result<Option<InstallationPlan>>;
    fn put_plan(&self, plan: &InstallationPlan, requested: &str) -> Result<()>;
}

/// Fetch and validate. Invalid plans are reported as a miss.
pub fn lookup(store: &dyn PlanStore, key: &PlanCacheKey) -> Result<Option<InstallationPlan>> {
    let Some(plan) = store.get_plan(&key.tool, &key.version)? else {
        tracing::debug!(key = %key, "plan cache miss: no stored plan");
        return Ok(None);
    };
    match validate_cached_plan(&plan, key) {
        Ok(()) => Ok(Some(plan)),
        Err(reason) => {
            tracing::debug!(key = %key, %reason, "plan cache miss: stored plan is stale");
            Ok(None)
        }
    }
}
