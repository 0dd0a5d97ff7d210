//! CLI subcommands: deps, plan, install, validate, list, cache, completions.

use crate::actions::download::HttpDownloader;
use crate::actions::ActionRegistry;
use crate::core::config::Settings;
use crate::core::installer::{InstallOptions, Installer};
use crate::core::parser;
use crate::core::recipe::{parse_recipe_file, ChainLoader, DirLoader, EmbeddedLoader};
use crate::core::resolver::parse_dependency;
use crate::core::types::{Platform, ResolvedDeps};
use crate::core::version::RecipeVersionResolver;
use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(
    name = "kura",
    version,
    about = "Recipe-driven tool installer with transitive dependencies and checksum-pinned plans"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show what a tool needs at install time and at runtime
    Deps {
        /// Tool name
        tool: String,

        /// Resolve for this OS instead of the host
        #[arg(long)]
        os: Option<String>,

        /// Only the tool's own declarations, no closure
        #[arg(long)]
        direct: bool,
    },

    /// Generate an installation plan (tool[@constraint])
    Plan {
        spec: String,

        /// Ignore the cached plan
        #[arg(long)]
        fresh: bool,

        /// Target OS (default: host)
        #[arg(long)]
        os: Option<String>,

        /// Target architecture (default: host)
        #[arg(long)]
        arch: Option<String>,

        /// Write the plan here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Install a tool and its dependencies (tool[@constraint])
    Install {
        #[arg(required_unless_present = "plan")]
        spec: Option<String>,

        /// Re-resolve even if a plan is cached
        #[arg(long)]
        fresh: bool,

        /// Execute a plan file written by `kura plan`
        #[arg(long, conflicts_with_all = ["spec", "fresh"])]
        plan: Option<PathBuf>,

        /// Refuse dependencies that are not built-in recipes
        #[arg(long)]
        require_embedded: bool,
    },

    /// Check a recipe file without installing anything
    Validate {
        file: PathBuf,
    },

    /// List installed tools
    List,

    /// Inspect or empty the download cache
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },

    /// Print shell completions
    Completions {
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    /// Entry count and size
    Info,
    /// Remove every cached download
    Clear,
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "kura", &mut std::io::stdout());
            Ok(())
        }
        cmd => {
            let runtime = tokio::runtime::Runtime::new().context("cannot start async runtime")?;
            runtime.block_on(dispatch_async(cmd))
        }
    }
}

async fn dispatch_async(cmd: Commands) -> Result<()> {
    let settings = Settings::load()?;
    let installer = build_installer(settings)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling");
            on_signal.cancel();
        }
    });

    match cmd {
        Commands::Deps { tool, os, direct } => cmd_deps(&installer, &tool, os.as_deref(), direct, &cancel),
        Commands::Plan {
            spec,
            fresh,
            os,
            arch,
            output,
        } => cmd_plan(&installer, &spec, fresh, os, arch, output.as_deref(), &cancel).await,
        Commands::Install {
            spec,
            fresh,
            plan,
            require_embedded,
        } => {
            let opts = InstallOptions {
                fresh,
                require_embedded,
            };
            cmd_install(&installer, spec.as_deref(), plan.as_deref(), opts, &cancel).await
        }
        Commands::List => cmd_list(&installer),
        Commands::Cache { action } => cmd_cache(&installer, action),
        Commands::Validate { .. } | Commands::Completions { .. } => Ok(()),
    }
}

fn build_installer(settings: Settings) -> Result<Installer> {
    let loader = ChainLoader::new()
        .push(DirLoader::new(&settings.recipes_dir))
        .push(EmbeddedLoader);
    let versions = RecipeVersionResolver::new(&settings.github_api, settings.github_token.clone())?;
    let downloader = HttpDownloader::new()?;
    Ok(Installer::new(
        settings,
        Box::new(loader),
        Box::new(versions),
        Arc::new(downloader),
    ))
}

fn cmd_deps(
    installer: &Installer,
    tool: &str,
    os: Option<&str>,
    direct: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let host = Platform::host();
    let os = os.unwrap_or(host.os.as_str());
    let deps = if direct {
        installer.direct_dependencies(tool, Some(os))?
    } else {
        installer.dependencies(tool, Some(os), cancel)?
    };
    print_deps(tool, os, &deps);
    Ok(())
}

fn print_deps(tool: &str, os: &str, deps: &ResolvedDeps) {
    println!("{} ({})", tool, os);
    for (label, set) in [("install-time", &deps.install_time), ("runtime", &deps.runtime)] {
        println!("  {}:", label);
        if set.is_empty() {
            println!("    (none)");
        }
        for (name, version) in set {
            println!("    {}@{}", name, version);
        }
    }
}

async fn cmd_plan(
    installer: &Installer,
    spec: &str,
    fresh: bool,
    os: Option<String>,
    arch: Option<String>,
    output: Option<&Path>,
    cancel: &CancellationToken,
) -> Result<()> {
    let (tool, constraint) = parse_dependency(spec);
    let host = Platform::host();
    let platform = Platform::new(os.unwrap_or(host.os), arch.unwrap_or(host.arch));

    let plan = installer.plan(&tool, &constraint, &platform, fresh, cancel).await?;
    let json = serde_json::to_string_pretty(&plan)?;
    match output {
        Some(path) => {
            std::fs::write(path, json + "\n")
                .with_context(|| format!("cannot write {}", path.display()))?;
            eprintln!(
                "Plan for {}@{} ({}, {} steps) written to {}",
                plan.tool,
                plan.version,
                plan.platform,
                plan.steps.len(),
                path.display()
            );
        }
        None => println!("{}", json),
    }
    if !plan.deterministic {
        eprintln!("note: plan contains steps whose effects cannot be pinned");
    }
    Ok(())
}

async fn cmd_install(
    installer: &Installer,
    spec: Option<&str>,
    plan_file: Option<&Path>,
    opts: InstallOptions,
    cancel: &CancellationToken,
) -> Result<()> {
    let outcome = match (plan_file, spec) {
        (Some(path), _) => installer.install_plan_file(path, cancel).await?,
        (None, Some(spec)) => {
            let (tool, constraint) = parse_dependency(spec);
            installer.install(&tool, &constraint, opts, cancel).await?
        }
        (None, None) => bail!("nothing to install: give a tool or --plan"),
    };

    for dep in &outcome.installed_dependencies {
        println!("  + {} (dependency)", dep);
    }
    if outcome.already_installed {
        println!("{} {} is already installed", outcome.tool, outcome.version);
    } else {
        println!(
            "Installed {} {} -> {}",
            outcome.tool,
            outcome.version,
            outcome.install_dir.display()
        );
    }
    Ok(())
}

fn cmd_validate(file: &Path) -> Result<()> {
    let recipe = parse_recipe_file(file)?;
    let errors = parser::validate_recipe(&recipe, &ActionRegistry::builtin());

    if errors.is_empty() {
        println!("OK: {} ({} steps)", recipe.name(), recipe.steps.len());
        Ok(())
    } else {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        bail!("{} validation error(s)", errors.len())
    }
}

fn cmd_list(installer: &Installer) -> Result<()> {
    let state = installer.state().load()?;
    let active: BTreeMap<&str, &str> = state
        .tools
        .iter()
        .filter_map(|(name, t)| t.active_version.as_deref().map(|v| (name.as_str(), v)))
        .collect();
    if active.is_empty() {
        println!("No tools installed.");
    }
    for (name, version) in active {
        println!("{:<24} {}", name, version);
    }
    Ok(())
}

fn cmd_cache(installer: &Installer, action: CacheCommand) -> Result<()> {
    let cache = installer.cache();
    match action {
        CacheCommand::Info => {
            let info = cache.info()?;
            println!("{}", cache.dir().display());
            println!("  entries: {}", info.entries);
            println!("  size:    {} bytes", info.total_bytes);
        }
        CacheCommand::Clear => {
            let removed = cache.clear()?;
            println!("Removed {} cached download(s)", removed);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_install_spec() {
        let cli = Cli::try_parse_from(["kura", "install", "jq@1.7", "--fresh"]).unwrap();
        match cli.command {
            Commands::Install { spec, fresh, plan, .. } => {
                assert_eq!(spec.as_deref(), Some("jq@1.7"));
                assert!(fresh);
                assert!(plan.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_install_needs_spec_or_plan() {
        assert!(Cli::try_parse_from(["kura", "install"]).is_err());
        assert!(Cli::try_parse_from(["kura", "install", "--plan", "p.json"]).is_ok());
    }

    #[test]
    fn test_validate_embedded_recipe_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jq.toml");
        std::fs::write(&path, include_str!("../../recipes/jq.toml")).unwrap();
        cmd_validate(&path).unwrap();

        std::fs::write(&path, "[metadata]\nname = \"x\"\n[[steps]]\naction = \"nope\"\n").unwrap();
        assert!(cmd_validate(&path).is_err());
    }
}
