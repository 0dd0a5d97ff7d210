//! Primitive actions: the only kinds of step an evaluable plan contains.

use super::extract::{extract_archive, ArchiveFormat};
use super::{download_file_name, required_str, Action, ActionDeps, ActionRegistry, ExecutionContext};
use crate::core::error::{Error, Result};
use crate::core::types::{param_str, param_string_list, value_to_string, Params};
use crate::transport::{local, ExecOptions};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub(super) fn register(registry: &mut ActionRegistry) {
    registry.register(Arc::new(DownloadAction));
    registry.register(Arc::new(ExtractAction));
    registry.register(Arc::new(ChmodAction));
    registry.register(Arc::new(InstallBinariesAction));
    registry.register(Arc::new(SetEnvAction));
    registry.register(Arc::new(SetRpathAction));
    registry.register(Arc::new(RunCommandAction));
}

/// Run one of the primitives in this module by name. Composite actions use
/// this when executed directly instead of through a plan.
pub(super) async fn execute_primitive(
    ctx: &ExecutionContext,
    action: &str,
    params: &Params,
) -> Result<()> {
    match action {
        "download" => DownloadAction.execute(ctx, params).await,
        "extract" => ExtractAction.execute(ctx, params).await,
        "chmod" => ChmodAction.execute(ctx, params).await,
        "install_binaries" => InstallBinariesAction.execute(ctx, params).await,
        "set_env" => SetEnvAction.execute(ctx, params).await,
        "set_rpath" => SetRpathAction.execute(ctx, params).await,
        "run_command" => RunCommandAction.execute(ctx, params).await,
        other => Err(Error::UnknownAction(other.to_string())),
    }
}

/// Resolve a relative param path against `base`, refusing to leave it.
pub(crate) fn resolve_under(base: &Path, rel: &str, action: &str) -> Result<PathBuf> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute()
        || rel_path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(Error::action(
            action,
            format!("path '{}' must stay inside the work directory", rel),
        ));
    }
    Ok(base.join(rel_path))
}

fn parse_mode(action: &str, mode: &str) -> Result<u32> {
    u32::from_str_radix(mode.trim_start_matches("0o"), 8)
        .map_err(|_| Error::action(action, format!("invalid octal mode '{}'", mode)))
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| Error::io(path, e))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

// ============================================================================
// download
// ============================================================================

/// Fetch `url` into the work directory as `dest` (default: URL file name).
/// Checksum verification against a plan happens in the executor.
pub struct DownloadAction;

#[async_trait]
impl Action for DownloadAction {
    fn name(&self) -> &'static str {
        "download"
    }

    fn is_deterministic(&self) -> bool {
        true
    }

    fn is_evaluable(&self) -> bool {
        true
    }

    fn is_download(&self) -> bool {
        true
    }

    fn validate_params(&self, params: &Params) -> Result<()> {
        required_str(self.name(), params, "url")?;
        Ok(())
    }

    async fn execute(&self, ctx: &ExecutionContext, params: &Params) -> Result<()> {
        let url = required_str(self.name(), params, "url")?;
        let dest = resolve_under(&ctx.work_dir, &download_file_name(params, url), self.name())?;
        let outcome = ctx.downloader.download(url, &dest, &ctx.cancel).await?;
        if let Some(cache) = &ctx.download_cache {
            if let Err(e) = cache.save(url, &outcome.path, Some(&outcome.checksum)) {
                tracing::warn!(url, error = %e, "cannot populate download cache");
            }
        }
        Ok(())
    }
}

// ============================================================================
// extract
// ============================================================================

pub struct ExtractAction;

#[async_trait]
impl Action for ExtractAction {
    fn name(&self) -> &'static str {
        "extract"
    }

    fn is_deterministic(&self) -> bool {
        true
    }

    fn is_evaluable(&self) -> bool {
        true
    }

    fn validate_params(&self, params: &Params) -> Result<()> {
        let archive = required_str(self.name(), params, "archive")?;
        ArchiveFormat::parse(param_str(params, "format").unwrap_or("auto"), archive)?;
        Ok(())
    }

    async fn execute(&self, ctx: &ExecutionContext, params: &Params) -> Result<()> {
        let archive_name = required_str(self.name(), params, "archive")?;
        let format = ArchiveFormat::parse(param_str(params, "format").unwrap_or("auto"), archive_name)?;
        let strip = params
            .get("strip_dirs")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;

        let archive = resolve_under(&ctx.work_dir, archive_name, self.name())?;
        let dest = match param_str(params, "dest") {
            Some(sub) => resolve_under(&ctx.work_dir, sub, self.name())?,
            None => ctx.work_dir.clone(),
        };

        let written = tokio::task::spawn_blocking(move || extract_archive(&archive, &dest, format, strip))
            .await
            .map_err(|e| Error::action("extract", e.to_string()))??;
        tracing::debug!(archive = archive_name, entries = written, "extracted");
        Ok(())
    }
}

// ============================================================================
// chmod
// ============================================================================

pub struct ChmodAction;

#[async_trait]
impl Action for ChmodAction {
    fn name(&self) -> &'static str {
        "chmod"
    }

    fn is_deterministic(&self) -> bool {
        true
    }

    fn is_evaluable(&self) -> bool {
        true
    }

    fn validate_params(&self, params: &Params) -> Result<()> {
        if param_string_list(params, "files").unwrap_or_default().is_empty() {
            return Err(Error::action(self.name(), "missing required param 'files'"));
        }
        parse_mode(self.name(), param_str(params, "mode").unwrap_or("755"))?;
        Ok(())
    }

    async fn execute(&self, ctx: &ExecutionContext, params: &Params) -> Result<()> {
        self.validate_params(params)?;
        let mode = parse_mode(self.name(), param_str(params, "mode").unwrap_or("755"))?;
        for file in param_string_list(params, "files").unwrap_or_default() {
            let path = resolve_under(&ctx.work_dir, &file, self.name())?;
            if !path.exists() {
                return Err(Error::action(self.name(), format!("file not found: {}", file)));
            }
            set_mode(&path, mode)?;
        }
        Ok(())
    }
}

// ============================================================================
// install_binaries
// ============================================================================

/// Copy listed work-dir files into `{install_dir}/bin`, executable.
pub struct InstallBinariesAction;

#[async_trait]
impl Action for InstallBinariesAction {
    fn name(&self) -> &'static str {
        "install_binaries"
    }

    fn is_deterministic(&self) -> bool {
        true
    }

    fn is_evaluable(&self) -> bool {
        true
    }

    fn validate_params(&self, params: &Params) -> Result<()> {
        if param_string_list(params, "binaries").unwrap_or_default().is_empty() {
            return Err(Error::action(self.name(), "missing required param 'binaries'"));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &ExecutionContext, params: &Params) -> Result<()> {
        self.validate_params(params)?;
        let bin_dir = ctx.bin_dir();
        std::fs::create_dir_all(&bin_dir).map_err(|e| Error::io(&bin_dir, e))?;

        for binary in param_string_list(params, "binaries").unwrap_or_default() {
            let src = resolve_under(&ctx.work_dir, &binary, self.name())?;
            let file_name = src
                .file_name()
                .ok_or_else(|| Error::action(self.name(), format!("invalid binary path '{}'", binary)))?;
            let dest = bin_dir.join(file_name);
            std::fs::copy(&src, &dest).map_err(|e| Error::io(&src, e))?;
            set_mode(&dest, 0o755)?;
            tracing::info!(tool = %ctx.tool, binary = %dest.display(), "installed binary");
        }
        Ok(())
    }
}

// ============================================================================
// set_env
// ============================================================================

/// Write `vars` as `export` lines into `{install_dir}/env.sh`.
pub struct SetEnvAction;

#[async_trait]
impl Action for SetEnvAction {
    fn name(&self) -> &'static str {
        "set_env"
    }

    fn is_deterministic(&self) -> bool {
        true
    }

    fn is_evaluable(&self) -> bool {
        true
    }

    fn validate_params(&self, params: &Params) -> Result<()> {
        match params.get("vars") {
            Some(serde_json::Value::Object(_)) => Ok(()),
            _ => Err(Error::action(self.name(), "param 'vars' must be a table")),
        }
    }

    async fn execute(&self, ctx: &ExecutionContext, params: &Params) -> Result<()> {
        let Some(serde_json::Value::Object(vars)) = params.get("vars") else {
            return Err(Error::action(self.name(), "param 'vars' must be a table"));
        };
        std::fs::create_dir_all(&ctx.install_dir).map_err(|e| Error::io(&ctx.install_dir, e))?;

        let install_dir = ctx.install_dir.display().to_string();
        let mut content = String::new();
        for (key, value) in vars {
            let value = value_to_string(value).replace("{install_dir}", &install_dir);
            content.push_str(&format!("export {}=\"{}\"\n", key, value.replace('"', "\\\"")));
        }
        let path = ctx.install_dir.join("env.sh");
        std::fs::write(&path, content).map_err(|e| Error::io(&path, e))?;
        Ok(())
    }
}

// ============================================================================
// set_rpath
// ============================================================================

/// Point installed ELF/Mach-O files at a library directory.
pub struct SetRpathAction;

#[async_trait]
impl Action for SetRpathAction {
    fn name(&self) -> &'static str {
        "set_rpath"
    }

    fn dependencies(&self) -> ActionDeps {
        ActionDeps {
            linux_install_time: vec!["patchelf".to_string()],
            ..ActionDeps::default()
        }
    }

    fn is_deterministic(&self) -> bool {
        true
    }

    fn is_evaluable(&self) -> bool {
        true
    }

    fn validate_params(&self, params: &Params) -> Result<()> {
        if param_string_list(params, "files").unwrap_or_default().is_empty() {
            return Err(Error::action(self.name(), "missing required param 'files'"));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &ExecutionContext, params: &Params) -> Result<()> {
        self.validate_params(params)?;
        let rpath = param_str(params, "rpath").unwrap_or("$ORIGIN/../lib");
        let opts = ExecOptions::in_dir(&ctx.install_dir).with_env("PATH", ctx.search_path());

        for file in param_string_list(params, "files").unwrap_or_default() {
            let path = resolve_under(&ctx.install_dir, &file, self.name())?;
            let target = path.display().to_string();
            let (program, args) = match ctx.platform.os.as_str() {
                "linux" => (
                    "patchelf",
                    vec!["--set-rpath".to_string(), rpath.to_string(), target],
                ),
                "darwin" => (
                    "install_name_tool",
                    vec![
                        "-add_rpath".to_string(),
                        rpath.replace("$ORIGIN", "@loader_path"),
                        target,
                    ],
                ),
                other => {
                    return Err(Error::action(
                        self.name(),
                        format!("unsupported on {}", other),
                    ))
                }
            };
            let out = local::run_program(program, &args, &opts, &ctx.cancel).await?;
            if !out.success() {
                return Err(Error::action(
                    self.name(),
                    format!("{} failed on {}: {}", program, file, out.stderr.trim()),
                ));
            }
        }
        Ok(())
    }
}

// ============================================================================
// run_command
// ============================================================================

/// Arbitrary shell. Never evaluable: its effects cannot be pinned.
pub struct RunCommandAction;

#[async_trait]
impl Action for RunCommandAction {
    fn name(&self) -> &'static str {
        "run_command"
    }

    fn validate_params(&self, params: &Params) -> Result<()> {
        required_str(self.name(), params, "command")?;
        Ok(())
    }

    async fn execute(&self, ctx: &ExecutionContext, params: &Params) -> Result<()> {
        let command = required_str(self.name(), params, "command")?;
        let cwd = match param_str(params, "cwd") {
            Some(sub) => resolve_under(&ctx.work_dir, sub, self.name())?,
            None => ctx.work_dir.clone(),
        };
        let opts = ExecOptions::in_dir(cwd)
            .with_env("PATH", ctx.search_path())
            .with_env("KURA_INSTALL_DIR", ctx.install_dir.display().to_string())
            .with_env("KURA_VERSION", ctx.version.clone());

        let out = local::exec_local(command, &opts, &ctx.cancel).await?;
        if !out.success() {
            return Err(Error::action(
                self.name(),
                format!("exit code {}: {}", out.exit_code, out.stderr.trim()),
            ));
        }
        Ok(())
    }
}
