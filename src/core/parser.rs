//! Structural validation of parsed recipes.
//!
//! Checks what serde cannot:
//! - Name present, at least one step
//! - Every step names a registered action whose params validate
//! - `when.platform` entries are `os/arch` tuples
//! - Dependency strings are `name` or `name@version`
//! - The version source is one kura knows

use super::types::{Recipe, Step};
use crate::actions::ActionRegistry;

/// Validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

const VERSION_SOURCES: &[&str] = &["static", "github_releases"];

/// Validate a parsed recipe. Returns a list of errors (empty = valid).
pub fn validate_recipe(recipe: &Recipe, registry: &ActionRegistry) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let name = recipe.name();

    if name.is_empty() {
        errors.push(ValidationError {
            message: "metadata.name must not be empty".to_string(),
        });
    }
    if recipe.steps.is_empty() {
        errors.push(ValidationError {
            message: format!("recipe '{}' has no steps", name),
        });
    }

    // Recipe-level dependency lists
    let meta = &recipe.metadata;
    let lists = [
        ("dependencies", meta.dependencies.as_deref().unwrap_or_default()),
        (
            "runtime_dependencies",
            meta.runtime_dependencies.as_deref().unwrap_or_default(),
        ),
        ("extra_dependencies", meta.extra_dependencies.as_slice()),
        (
            "extra_runtime_dependencies",
            meta.extra_runtime_dependencies.as_slice(),
        ),
    ];
    for (field, deps) in lists {
        for dep in deps {
            if let Some(problem) = dependency_problem(dep) {
                errors.push(ValidationError {
                    message: format!("metadata.{}: '{}' {}", field, dep, problem),
                });
            }
        }
    }

    // Version source
    if let Some(source) = &recipe.version.source {
        if !VERSION_SOURCES.contains(&source.as_str()) {
            errors.push(ValidationError {
                message: format!(
                    "version.source '{}' is not one of: {}",
                    source,
                    VERSION_SOURCES.join(", ")
                ),
            });
        }
        if source == "github_releases" && recipe.version.github_repo.is_none() {
            errors.push(ValidationError {
                message: "version.source github_releases requires version.github_repo".to_string(),
            });
        }
    }

    for (i, step) in recipe.steps.iter().enumerate() {
        validate_step(i + 1, step, registry, &mut errors);
    }

    errors
}

fn validate_step(
    index: usize,
    step: &Step,
    registry: &ActionRegistry,
    errors: &mut Vec<ValidationError>,
) {
    match registry.get(&step.action) {
        None => errors.push(ValidationError {
            message: format!("step {}: unknown action '{}'", index, step.action),
        }),
        Some(action) => {
            if let Err(e) = action.validate_params(&step.params) {
                errors.push(ValidationError {
                    message: format!("step {}: {}", index, e),
                });
            }
        }
    }

    for tuple in &step.when.platform {
        let valid = matches!(tuple.split_once('/'), Some((os, arch)) if !os.is_empty() && !arch.is_empty() && !arch.contains('/'));
        if !valid {
            errors.push(ValidationError {
                message: format!(
                    "step {}: when.platform '{}' must be an os/arch tuple",
                    index, tuple
                ),
            });
        }
    }

    let overrides = step.overrides();
    let lists = [
        overrides.dependencies.unwrap_or_default(),
        overrides.runtime_dependencies.unwrap_or_default(),
        overrides.extra_dependencies,
        overrides.extra_runtime_dependencies,
    ];
    for dep in lists.iter().flatten() {
        if let Some(problem) = dependency_problem(dep) {
            errors.push(ValidationError {
                message: format!("step {}: dependency '{}' {}", index, dep, problem),
            });
        }
    }
}

/// Why a dependency string is malformed, if it is.
fn dependency_problem(dep: &str) -> Option<&'static str> {
    if dep.trim().is_empty() {
        return Some("is empty");
    }
    if dep.chars().any(char::is_whitespace) {
        return Some("contains whitespace");
    }
    match dep.split_once('@') {
        Some(("", _)) => Some("has no tool name"),
        Some((_, "")) => Some("has an empty version after '@'"),
        Some((_, version)) if version.contains('@') => Some("has more than one '@'"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::recipe::parse_recipe;

    fn errors_for(toml_src: &str) -> Vec<String> {
        let recipe = parse_recipe(toml_src, "").unwrap();
        validate_recipe(&recipe, &ActionRegistry::builtin())
            .into_iter()
            .map(|e| e.message)
            .collect()
    }

    #[test]
    fn test_valid_recipe() {
        let errors = errors_for(
            r#"
[metadata]
name = "tool"
extra_dependencies = ["zlib@1.3"]

[[steps]]
action = "download_archive"
url = "https://example.com/tool.tar.gz"
binaries = ["tool"]
when = { platform = ["linux/amd64"] }
"#,
        );
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
    }

    #[test]
    fn test_empty_name_and_no_steps() {
        let errors = errors_for("[metadata]\n");
        assert!(errors.iter().any(|e| e.contains("name must not be empty")));
        assert!(errors.iter().any(|e| e.contains("has no steps")));
    }

    #[test]
    fn test_unknown_action() {
        let errors = errors_for("[metadata]\nname = \"t\"\n[[steps]]\naction = \"teleport\"\n");
        assert_eq!(errors, vec!["step 1: unknown action 'teleport'"]);
    }

    #[test]
    fn test_bad_params_reported() {
        let errors = errors_for("[metadata]\nname = \"t\"\n[[steps]]\naction = \"download\"\n");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("missing required param 'url'"));
    }

    #[test]
    fn test_bad_platform_tuple() {
        let errors = errors_for(
            "[metadata]\nname = \"t\"\n[[steps]]\naction = \"run_command\"\ncommand = \"true\"\nwhen = { platform = [\"linux\"] }\n",
        );
        assert!(errors[0].contains("os/arch tuple"));
    }

    #[test]
    fn test_malformed_dependencies() {
        let errors = errors_for(
            r#"
[metadata]
name = "t"
dependencies = ["@1.0", "ok@2"]
extra_runtime_dependencies = ["name@"]

[[steps]]
action = "run_command"
command = "true"
extra_dependencies = ["two words"]
"#,
        );
        assert_eq!(errors.len(), 3, "{:?}", errors);
        assert!(errors.iter().any(|e| e.contains("has no tool name")));
        assert!(errors.iter().any(|e| e.contains("empty version")));
        assert!(errors.iter().any(|e| e.contains("whitespace")));
    }

    #[test]
    fn test_version_source_checks() {
        let errors = errors_for(
            "[metadata]\nname = \"t\"\n[version]\nsource = \"github_releases\"\n[[steps]]\naction = \"run_command\"\ncommand = \"true\"\n",
        );
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("requires version.github_repo"));
    }
}
