//! Plan execution.
//!
//! Every step is validated before the first one runs. Download steps carrying
//! a checksum are served from the download cache when an intact entry
//! matches, and are otherwise fetched and compared against the plan. A
//! mismatch aborts the install; nothing past that step runs.

use super::error::{ChecksumMismatch, Error, Result};
use super::types::{
    param_str, InstallationPlan, Platform, ProvenanceEvent, ResolvedStep, VerifySection,
    PLAN_FORMAT_VERSION,
};
use crate::actions::builtin::resolve_under;
use crate::actions::download::normalize_checksum;
use crate::actions::{describe_params, download_file_name, ActionRegistry, ExecutionContext};
use crate::transport::{local, ExecOptions};
use crate::tripwire::eventlog;
use std::time::Instant;

/// Reject a plan before anything runs: format, platform, actions, params.
pub fn validate_plan(plan: &InstallationPlan, registry: &ActionRegistry, host: &Platform) -> Result<()> {
    if plan.format_version != PLAN_FORMAT_VERSION {
        return Err(Error::UnsupportedPlanFormat {
            found: plan.format_version,
            expected: PLAN_FORMAT_VERSION,
        });
    }
    if plan.platform.key() != host.key() {
        return Err(Error::PlatformMismatch {
            plan: plan.platform.key(),
            host: host.key(),
        });
    }
    for (i, step) in plan.steps.iter().enumerate() {
        let action = registry
            .get(&step.action)
            .ok_or_else(|| Error::UnknownAction(step.action.clone()))?;
        action.validate_params(&step.params).map_err(|e| wrap(i, step, e))?;
    }
    Ok(())
}

/// Run every step of `plan` in order, then the verify command.
pub async fn execute_plan(
    registry: &ActionRegistry,
    plan: &InstallationPlan,
    ctx: &ExecutionContext,
) -> Result<()> {
    validate_plan(plan, registry, &Platform::host())?;

    std::fs::create_dir_all(&ctx.work_dir).map_err(|e| Error::io(&ctx.work_dir, e))?;
    std::fs::create_dir_all(&ctx.install_dir).map_err(|e| Error::io(&ctx.install_dir, e))?;

    for (i, step) in plan.steps.iter().enumerate() {
        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let Some(action) = registry.get(&step.action) else {
            return Err(Error::UnknownAction(step.action.clone()));
        };

        let started = Instant::now();
        tracing::info!(tool = %ctx.tool, step = i + 1, action = %step.action, "running step");
        tracing::debug!(step = i + 1, params = %describe_params(&step.params), "step params");

        let result = match &step.checksum {
            Some(expected) if !expected.trim().is_empty() && action.is_download() => {
                verified_download(ctx, step, expected).await
            }
            _ => action.execute(ctx, &step.params).await,
        };
        result.map_err(|e| wrap(i, step, e))?;

        eventlog::record(
            ctx.events.as_ref(),
            ProvenanceEvent::StepCompleted {
                tool: ctx.tool.clone(),
                index: i + 1,
                action: step.action.clone(),
                duration_seconds: started.elapsed().as_secs_f64(),
            },
        );
    }

    if let Some(verify) = &plan.verify {
        run_verify(ctx, verify).await?;
    }
    Ok(())
}

fn wrap(index: usize, step: &ResolvedStep, source: Error) -> Error {
    Error::StepFailed {
        index: index + 1,
        action: step.action.clone(),
        source: Box::new(source),
    }
}

async fn verified_download(ctx: &ExecutionContext, step: &ResolvedStep, expected: &str) -> Result<()> {
    let url = step
        .url
        .as_deref()
        .or_else(|| param_str(&step.params, "url"))
        .ok_or_else(|| Error::action(&step.action, "missing required param 'url'"))?;
    let expected = normalize_checksum(expected);
    let dest = resolve_under(&ctx.work_dir, &download_file_name(&step.params, url), &step.action)?;

    if let Some(cache) = &ctx.download_cache {
        match cache.check(url, &dest, &expected) {
            Ok(true) => {
                tracing::debug!(url, "served from download cache");
                record_verified(ctx, url, &expected);
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(url, error = %e, "cannot read download cache"),
        }
    }

    let outcome = ctx.downloader.download(url, &dest, &ctx.cancel).await?;
    if outcome.checksum != expected {
        let _ = std::fs::remove_file(&outcome.path);
        eventlog::record(
            ctx.events.as_ref(),
            ProvenanceEvent::ChecksumMismatch {
                tool: ctx.tool.clone(),
                url: url.to_string(),
                expected: expected.clone(),
                actual: outcome.checksum.clone(),
            },
        );
        return Err(Error::ChecksumMismatch(ChecksumMismatch {
            url: url.to_string(),
            expected,
            actual: outcome.checksum,
        }));
    }

    if let Some(cache) = &ctx.download_cache {
        if let Err(e) = cache.save(url, &outcome.path, Some(&expected)) {
            tracing::warn!(url, error = %e, "cannot populate download cache");
        }
    }
    record_verified(ctx, url, &expected);
    Ok(())
}

fn record_verified(ctx: &ExecutionContext, url: &str, checksum: &str) {
    eventlog::record(
        ctx.events.as_ref(),
        ProvenanceEvent::ChecksumVerified {
            tool: ctx.tool.clone(),
            url: url.to_string(),
            checksum: checksum.to_string(),
        },
    );
}

/// Run the verify command with the installed tool on PATH. `{version}` and
/// `{install_dir}` are expanded in both the command and the pattern.
async fn run_verify(ctx: &ExecutionContext, verify: &VerifySection) -> Result<()> {
    let expand = |s: &str| {
        s.replace("{version}", &ctx.version)
            .replace("{install_dir}", &ctx.install_dir.display().to_string())
    };
    let command = expand(&verify.command);
    let opts = ExecOptions::in_dir(&ctx.install_dir).with_env("PATH", ctx.search_path());

    tracing::info!(tool = %ctx.tool, command = %command, "verifying install");
    let out = local::exec_local(&command, &opts, &ctx.cancel).await?;
    if !out.success() {
        return Err(Error::action(
            "verify",
            format!("'{}' exited with {}: {}", command, out.exit_code, out.combined().trim()),
        ));
    }
    if let Some(pattern) = &verify.pattern {
        let pattern = expand(pattern);
        if !out.combined().contains(&pattern) {
            return Err(Error::action(
                "verify",
                format!("output of '{}' does not contain '{}'", command, pattern),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::builtin::tests::test_ctx;
    use crate::actions::cache::DownloadCache;
    use crate::core::error::ErrorKind;
    use crate::core::types::{Params, RecipeType};
    use crate::tripwire::eventlog::EventLog;
    use crate::tripwire::hasher;
    use chrono::Utc;
    use serde_json::json;

    fn params(v: serde_json::Value) -> Params {
        v.as_object().cloned().unwrap()
    }

    fn plan(steps: Vec<ResolvedStep>) -> InstallationPlan {
        InstallationPlan {
            format_version: PLAN_FORMAT_VERSION,
            tool: "tool".into(),
            version: "1.0.0".into(),
            platform: Platform::host(),
            generated_at: Utc::now(),
            recipe_hash: "blake3:test".into(),
            recipe_source: "memory".into(),
            recipe_type: RecipeType::Tool,
            deterministic: true,
            steps,
            verify: None,
        }
    }

    fn download_step(url: &str, checksum: &str) -> ResolvedStep {
        ResolvedStep {
            action: "download".into(),
            params: params(json!({ "url": url, "dest": "artifact.bin" })),
            evaluable: true,
            deterministic: true,
            url: Some(url.to_string()),
            checksum: Some(checksum.to_string()),
            size: None,
        }
    }

    fn command_step(command: &str) -> ResolvedStep {
        ResolvedStep {
            action: "run_command".into(),
            params: params(json!({ "command": command })),
            evaluable: false,
            deterministic: false,
            url: None,
            checksum: None,
            size: None,
        }
    }

    fn artifact(dir: &std::path::Path, bytes: &[u8]) -> (String, String) {
        let src = dir.join("upstream.bin");
        std::fs::write(&src, bytes).unwrap();
        let sum = hasher::sha256_file(&src).unwrap();
        (format!("file://{}", src.display()), sum)
    }

    #[test]
    fn test_validate_rejects_format_version() {
        let mut p = plan(vec![]);
        p.format_version = 1;
        let err = validate_plan(&p, &ActionRegistry::builtin(), &Platform::host()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedPlanFormat);
    }

    #[test]
    fn test_validate_rejects_foreign_platform() {
        let mut p = plan(vec![]);
        p.platform = Platform::new("plan9", "mips");
        let err = validate_plan(&p, &ActionRegistry::builtin(), &Platform::host()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PlatformMismatch);
    }

    #[test]
    fn test_validate_rejects_unknown_action_and_bad_params() {
        let registry = ActionRegistry::builtin();
        let mut step = command_step("true");
        step.action = "teleport".into();
        let err = validate_plan(&plan(vec![step]), &registry, &Platform::host()).unwrap_err();
        assert!(matches!(err, Error::UnknownAction(ref a) if a == "teleport"));

        let mut step = download_step("https://example.com/a", "00");
        step.params.remove("url");
        let err = validate_plan(&plan(vec![command_step("true"), step]), &registry, &Platform::host())
            .unwrap_err();
        assert!(matches!(err, Error::StepFailed { index: 2, .. }));
    }

    #[tokio::test]
    async fn test_verified_download_and_cache_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let (url, sum) = artifact(dir.path(), b"good bytes");
        let mut ctx = test_ctx(dir.path());
        ctx.download_cache = Some(DownloadCache::new(dir.path().join("cache")));
        ctx.events = Some(EventLog::new(dir.path().join("events.jsonl")));
        let registry = ActionRegistry::builtin();

        let p = plan(vec![download_step(&url, &format!("sha256:{}", sum.to_uppercase()))]);
        execute_plan(&registry, &p, &ctx).await.unwrap();
        assert_eq!(std::fs::read(ctx.work_dir.join("artifact.bin")).unwrap(), b"good bytes");

        // Upstream disappears; the cache still satisfies the pinned checksum
        std::fs::remove_file(dir.path().join("upstream.bin")).unwrap();
        std::fs::remove_file(ctx.work_dir.join("artifact.bin")).unwrap();
        execute_plan(&registry, &p, &ctx).await.unwrap();
        assert!(ctx.work_dir.join("artifact.bin").exists());

        let events = ctx.events.as_ref().unwrap().read_all().unwrap();
        let verified = events
            .iter()
            .filter(|e| matches!(e.event, ProvenanceEvent::ChecksumVerified { .. }))
            .count();
        assert_eq!(verified, 2);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let (url, actual) = artifact(dir.path(), b"tampered");
        let ctx = test_ctx(dir.path());
        let marker = dir.path().join("ran");
        let expected = "0".repeat(64);

        let p = plan(vec![
            download_step(&url, &expected),
            command_step(&format!("touch {}", marker.display())),
        ]);
        let err = execute_plan(&ActionRegistry::builtin(), &p, &ctx).await.unwrap_err();

        assert!(matches!(err, Error::StepFailed { index: 1, .. }));
        assert_eq!(err.kind(), ErrorKind::ChecksumMismatch);
        let mismatch = err.checksum_mismatch().unwrap();
        assert_eq!(mismatch.expected, expected);
        assert_eq!(mismatch.actual, actual);
        assert!(!ctx.work_dir.join("artifact.bin").exists());
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_blank_checksum_is_not_verified() {
        let dir = tempfile::tempdir().unwrap();
        let (url, _sum) = artifact(dir.path(), b"unpinned bytes");
        let ctx = test_ctx(dir.path());

        let p = plan(vec![download_step(&url, "")]);
        execute_plan(&ActionRegistry::builtin(), &p, &ctx).await.unwrap();
        assert_eq!(std::fs::read(ctx.work_dir.join("artifact.bin")).unwrap(), b"unpinned bytes");
    }

    #[tokio::test]
    async fn test_cancelled_before_first_step() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        ctx.cancel.cancel();
        let err = execute_plan(&ActionRegistry::builtin(), &plan(vec![command_step("true")]), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_step_error_is_wrapped_with_index() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let p = plan(vec![command_step("true"), command_step("exit 3")]);
        let err = execute_plan(&ActionRegistry::builtin(), &p, &ctx).await.unwrap_err();
        assert!(matches!(err, Error::StepFailed { index: 2, ref action, .. } if action == "run_command"));
    }

    #[tokio::test]
    async fn test_verify_expands_version() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());
        let registry = ActionRegistry::builtin();

        let mut p = plan(vec![]);
        p.verify = Some(VerifySection {
            command: "echo tool {version}".into(),
            pattern: Some("tool {version}".into()),
        });
        execute_plan(&registry, &p, &ctx).await.unwrap();

        p.verify = Some(VerifySection {
            command: "echo tool 0.9".into(),
            pattern: Some("{version}".into()),
        });
        let err = execute_plan(&registry, &p, &ctx).await.unwrap_err();
        assert!(err.to_string().contains("does not contain '1.0.0'"));
    }
}
