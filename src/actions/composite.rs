//! Composite archive actions. Plans never contain these; they decompose
//! into download → extract → chmod → install_binaries.

use super::builtin::execute_primitive;
use super::extract::ArchiveFormat;
use super::{
    expand_params, expand_vars, required_str, Action, ActionRegistry, Decomposable,
    DecomposedStep, EvalContext, ExecutionContext,
};
use crate::core::error::{Error, Result};
use crate::core::types::{param_str, param_string_list, Params};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

pub(super) fn register(registry: &mut ActionRegistry) {
    registry.register(Arc::new(DownloadArchiveAction));
    registry.register(Arc::new(GitHubArchiveAction));
}

/// The four primitives every archive install expands into.
fn archive_steps(
    action: &str,
    url: String,
    file_name: String,
    params: &Params,
) -> Result<Vec<DecomposedStep>> {
    let binaries = param_string_list(params, "binaries").unwrap_or_default();
    if binaries.is_empty() {
        return Err(Error::action(action, "missing required param 'binaries'"));
    }
    let format = match param_str(params, "archive_format") {
        Some(f) => {
            ArchiveFormat::parse(f, &file_name)?;
            f.to_string()
        }
        None => {
            ArchiveFormat::parse("auto", &file_name)?;
            "auto".to_string()
        }
    };
    let strip_dirs = params.get("strip_dirs").and_then(Value::as_u64).unwrap_or(0);

    let mut download = json!({ "url": url, "dest": file_name });
    if let Some(checksum) = param_str(params, "checksum") {
        download["checksum"] = json!(checksum);
    }

    let steps = [
        ("download", download),
        (
            "extract",
            json!({ "archive": file_name, "format": format, "strip_dirs": strip_dirs }),
        ),
        ("chmod", json!({ "files": binaries })),
        ("install_binaries", json!({ "binaries": binaries })),
    ];
    Ok(steps
        .into_iter()
        .map(|(name, v)| DecomposedStep::new(name, v.as_object().cloned().unwrap_or_default()))
        .collect())
}

fn file_name_of(url: &str) -> String {
    super::download_file_name(&Params::new(), url)
}

async fn run_decomposed(
    ctx: &ExecutionContext,
    decomposable: &dyn Decomposable,
    params: &Params,
) -> Result<()> {
    std::fs::create_dir_all(&ctx.work_dir).map_err(|e| Error::io(&ctx.work_dir, e))?;
    for step in decomposable.decompose(&ctx.eval_context(), params)? {
        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        execute_primitive(ctx, &step.action, &step.params).await?;
    }
    Ok(())
}

// ============================================================================
// download_archive
// ============================================================================

/// Archive from an arbitrary URL template.
pub struct DownloadArchiveAction;

impl Decomposable for DownloadArchiveAction {
    fn decompose(&self, ctx: &EvalContext, params: &Params) -> Result<Vec<DecomposedStep>> {
        let expanded = expand_params(params, &ctx.vars_for(params));
        let url = required_str(self.name(), &expanded, "url")?.to_string();
        let file_name = file_name_of(&url);
        archive_steps(self.name(), url, file_name, &expanded)
    }
}

#[async_trait]
impl Action for DownloadArchiveAction {
    fn name(&self) -> &'static str {
        "download_archive"
    }

    fn is_deterministic(&self) -> bool {
        true
    }

    fn is_evaluable(&self) -> bool {
        true
    }

    fn validate_params(&self, params: &Params) -> Result<()> {
        required_str(self.name(), params, "url")?;
        Ok(())
    }

    fn as_decomposable(&self) -> Option<&dyn Decomposable> {
        Some(self)
    }

    async fn execute(&self, ctx: &ExecutionContext, params: &Params) -> Result<()> {
        run_decomposed(ctx, self, params).await
    }
}

// ============================================================================
// github_archive
// ============================================================================

/// Release asset from `https://github.com/{repo}/releases/download/{tag}/`.
pub struct GitHubArchiveAction;

impl Decomposable for GitHubArchiveAction {
    fn decompose(&self, ctx: &EvalContext, params: &Params) -> Result<Vec<DecomposedStep>> {
        let repo = required_str(self.name(), params, "repo")?;
        let pattern = required_str(self.name(), params, "asset_pattern")?;
        let vars = ctx.vars_for(params);
        let asset = expand_vars(pattern, &vars);
        let url = format!(
            "https://github.com/{}/releases/download/{}/{}",
            repo, ctx.version_tag, asset
        );
        archive_steps(self.name(), url, asset, &expand_params(params, &vars))
    }
}

#[async_trait]
impl Action for GitHubArchiveAction {
    fn name(&self) -> &'static str {
        "github_archive"
    }

    fn is_deterministic(&self) -> bool {
        true
    }

    fn is_evaluable(&self) -> bool {
        true
    }

    fn validate_params(&self, params: &Params) -> Result<()> {
        required_str(self.name(), params, "repo")?;
        required_str(self.name(), params, "asset_pattern")?;
        Ok(())
    }

    fn as_decomposable(&self) -> Option<&dyn Decomposable> {
        Some(self)
    }

    async fn execute(&self, ctx: &ExecutionContext, params: &Params) -> Result<()> {
        run_decomposed(ctx, self, params).await
    }
}
