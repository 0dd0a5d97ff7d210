//! Installs delegated to language package managers and system package
//! managers. None of these are evaluable: the package manager decides what
//! bytes arrive, so a plan can only record the request.

use super::{required_str, Action, ActionDeps, ActionRegistry, ExecutionContext};
use crate::core::error::{Error, Result};
use crate::core::types::{param_string_list, Params};
use crate::transport::{local, ExecOptions};
use async_trait::async_trait;
use std::sync::Arc;

pub(super) fn register(registry: &mut ActionRegistry) {
    for ecosystem in [
        Ecosystem::Npm,
        Ecosystem::Pipx,
        Ecosystem::Cargo,
        Ecosystem::Go,
        Ecosystem::Gem,
    ] {
        registry.register(Arc::new(EcosystemInstall(ecosystem)));
    }
    registry.register(Arc::new(SystemPackageInstall(SystemManager::Apt)));
    registry.register(Arc::new(SystemPackageInstall(SystemManager::Brew)));
}

// ============================================================================
// Language ecosystems
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ecosystem {
    Npm,
    Pipx,
    Cargo,
    Go,
    Gem,
}

impl Ecosystem {
    fn action_name(self) -> &'static str {
        match self {
            Ecosystem::Npm => "npm_install",
            Ecosystem::Pipx => "pipx_install",
            Ecosystem::Cargo => "cargo_install",
            Ecosystem::Go => "go_install",
            Ecosystem::Gem => "gem_install",
        }
    }

    /// Param naming the package.
    fn package_key(self) -> &'static str {
        match self {
            Ecosystem::Cargo => "crate",
            Ecosystem::Go => "module",
            _ => "package",
        }
    }

    /// Toolchain recipe this ecosystem needs.
    fn toolchain(self) -> &'static str {
        match self {
            Ecosystem::Npm => "nodejs",
            Ecosystem::Pipx => "python-standalone",
            Ecosystem::Cargo => "rust",
            Ecosystem::Go => "go",
            Ecosystem::Gem => "ruby",
        }
    }

    /// Whether installed executables still need the toolchain to run.
    fn needs_toolchain_at_runtime(self) -> bool {
        matches!(self, Ecosystem::Npm | Ecosystem::Pipx | Ecosystem::Gem)
    }

    /// Program, arguments, and extra environment for the install command.
    fn command(
        self,
        ctx: &ExecutionContext,
        package: &str,
    ) -> (&'static str, Vec<String>, Vec<(String, String)>) {
        let root = ctx.install_dir.display().to_string();
        let bin = ctx.bin_dir().display().to_string();
        match self {
            Ecosystem::Npm => (
                "npm",
                vec![
                    "install".into(),
                    "-g".into(),
                    format!("--prefix={}", root),
                    format!("{}@{}", package, ctx.version),
                ],
                vec![],
            ),
            Ecosystem::Pipx => (
                "pipx",
                vec![
                    "install".into(),
                    "--force".into(),
                    format!("{}=={}", package, ctx.version),
                ],
                vec![
                    ("PIPX_HOME".into(), format!("{}/pipx", root)),
                    ("PIPX_BIN_DIR".into(), bin),
                ],
            ),
            Ecosystem::Cargo => (
                "cargo",
                vec![
                    "install".into(),
                    "--locked".into(),
                    "--root".into(),
                    root,
                    package.into(),
                    "--version".into(),
                    ctx.version.clone(),
                ],
                vec![],
            ),
            Ecosystem::Go => (
                "go",
                vec!["install".into(), format!("{}@v{}", package, ctx.version.trim_start_matches('v'))],
                vec![("GOBIN".into(), bin)],
            ),
            Ecosystem::Gem => (
                "gem",
                vec![
                    "install".into(),
                    package.into(),
                    "--version".into(),
                    ctx.version.clone(),
                    "--install-dir".into(),
                    root,
                    "--bindir".into(),
                    bin,
                    "--no-document".into(),
                ],
                vec![],
            ),
        }
    }
}

/// `npm_install`, `pipx_install`, `cargo_install`, `go_install`,
/// `gem_install`.
pub struct EcosystemInstall(pub Ecosystem);

#[async_trait]
impl Action for EcosystemInstall {
    fn name(&self) -> &'static str {
        self.0.action_name()
    }

    fn dependencies(&self) -> ActionDeps {
        let toolchain = vec![self.0.toolchain().to_string()];
        ActionDeps {
            install_time: toolchain.clone(),
            eval_time: toolchain.clone(),
            runtime: if self.0.needs_toolchain_at_runtime() {
                toolchain
            } else {
                Vec::new()
            },
            ..ActionDeps::default()
        }
    }

    fn validate_params(&self, params: &Params) -> Result<()> {
        required_str(self.name(), params, self.0.package_key())?;
        if param_string_list(params, "executables").unwrap_or_default().is_empty() {
            return Err(Error::action(self.name(), "missing required param 'executables'"));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &ExecutionContext, params: &Params) -> Result<()> {
        self.validate_params(params)?;
        let package = required_str(self.name(), params, self.0.package_key())?;
        let (program, args, env) = self.0.command(ctx, package);

        std::fs::create_dir_all(ctx.bin_dir()).map_err(|e| Error::io(ctx.bin_dir(), e))?;
        let mut opts = ExecOptions::in_dir(&ctx.install_dir).with_env("PATH", ctx.search_path());
        opts.env.extend(env);

        tracing::info!(tool = %ctx.tool, program, package, version = %ctx.version, "running package manager");
        let out = local::run_program(program, &args, &opts, &ctx.cancel).await?;
        if !out.success() {
            return Err(Error::action(
                self.name(),
                format!("{} exited with {}: {}", program, out.exit_code, out.combined().trim()),
            ));
        }

        for exe in param_string_list(params, "executables").unwrap_or_default() {
            let path = ctx.bin_dir().join(&exe);
            if !path.exists() {
                return Err(Error::action(
                    self.name(),
                    format!("expected executable {} not found at {}", exe, path.display()),
                ));
            }
        }
        Ok(())
    }
}

// ============================================================================
// System package managers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemManager {
    Apt,
    Brew,
}

/// `apt_install` (Linux) and `brew_install` (macOS). Installs outside the
/// kura tree; only the request is recorded.
pub struct SystemPackageInstall(pub SystemManager);

#[async_trait]
impl Action for SystemPackageInstall {
    fn name(&self) -> &'static str {
        match self.0 {
            SystemManager::Apt => "apt_install",
            SystemManager::Brew => "brew_install",
        }
    }

    fn validate_params(&self, params: &Params) -> Result<()> {
        if param_string_list(params, "packages").unwrap_or_default().is_empty() {
            return Err(Error::action(self.name(), "missing required param 'packages'"));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &ExecutionContext, params: &Params) -> Result<()> {
        self.validate_params(params)?;
        let (program, expected_os, mut args) = match self.0 {
            SystemManager::Apt => ("apt-get", "linux", vec!["install".to_string(), "-y".to_string()]),
            SystemManager::Brew => ("brew", "darwin", vec!["install".to_string()]),
        };
        if ctx.platform.os != expected_os {
            return Err(Error::action(
                self.name(),
                format!("only available on {}", expected_os),
            ));
        }
        args.extend(param_string_list(params, "packages").unwrap_or_default());

        let out = local::run_program(program, &args, &ExecOptions::default(), &ctx.cancel).await?;
        if !out.success() {
            return Err(Error::action(
                self.name(),
                format!("{} exited with {}: {}", program, out.exit_code, out.stderr.trim()),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::builtin::tests::test_ctx;
    use serde_json::json;

    #[test]
    fn test_npm_declares_nodejs_everywhere() {
        let deps = EcosystemInstall(Ecosystem::Npm).dependencies();
        assert_eq!(deps.install_time, vec!["nodejs"]);
        assert_eq!(deps.runtime, vec!["nodejs"]);
        assert_eq!(deps.eval_time, vec!["nodejs"]);
    }

    #[test]
    fn test_cargo_has_no_runtime_toolchain() {
        let deps = EcosystemInstall(Ecosystem::Cargo).dependencies();
        assert_eq!(deps.install_time, vec!["rust"]);
        assert!(deps.runtime.is_empty());
    }

    #[test]
    fn test_validate_requires_package_and_executables() {
        let action = EcosystemInstall(Ecosystem::Go);
        let p = json!({"package": "x", "executables": ["x"]});
        assert!(action.validate_params(p.as_object().unwrap()).is_err());
        let p = json!({"module": "golang.org/x/tools/gopls", "executables": ["gopls"]});
        assert!(action.validate_params(p.as_object().unwrap()).is_ok());
    }

    #[test]
    fn test_commands_pin_version() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path());

        let (program, args, _) = Ecosystem::Npm.command(&ctx, "prettier");
        assert_eq!(program, "npm");
        assert_eq!(args.last().unwrap(), "prettier@1.0.0");

        let (_, args, env) = Ecosystem::Go.command(&ctx, "golang.org/x/tools/gopls");
        assert_eq!(args[1], "golang.org/x/tools/gopls@v1.0.0");
        assert_eq!(env[0].0, "GOBIN");
    }

    #[tokio::test]
    async fn test_system_manager_rejects_wrong_platform() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_ctx(dir.path());
        ctx.platform = crate::core::types::Platform::new("freebsd", "amd64");
        let p = json!({"packages": ["curl"]});
        let err = SystemPackageInstall(SystemManager::Apt)
            .execute(&ctx, p.as_object().unwrap())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("only available on linux"));
    }
}
