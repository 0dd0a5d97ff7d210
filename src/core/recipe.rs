//! Recipe parsing and loading.
//!
//! A loader maps a tool name to its recipe. Loaders compose: the CLI chains
//! a user recipe directory in front of the recipes compiled into the binary,
//! and tests inject recipes from memory.

use super::error::{Error, Result};
use super::types::Recipe;
use rustc_hash::FxHashMap;
use std::path::{Path, PathBuf};

/// Recipes shipped inside the binary.
const EMBEDDED: &[(&str, &str)] = &[
    ("jq", include_str!("../../recipes/jq.toml")),
    ("nodejs", include_str!("../../recipes/nodejs.toml")),
    ("patchelf", include_str!("../../recipes/patchelf.toml")),
    ("prettier", include_str!("../../recipes/prettier.toml")),
    ("ripgrep", include_str!("../../recipes/ripgrep.toml")),
];

/// A recipe together with where it came from.
#[derive(Debug, Clone)]
pub struct LoadedRecipe {
    pub recipe: Recipe,

    /// `embedded`, `memory`, or a file path
    pub source: String,
}

pub trait RecipeLoader: Send + Sync {
    /// Find the recipe for `name`. `Ok(None)` means no such recipe; errors
    /// are reserved for recipes that exist but cannot be read.
    fn locate(&self, name: &str) -> Result<Option<LoadedRecipe>>;

    fn load(&self, name: &str) -> Result<Option<Recipe>> {
        Ok(self.locate(name)?.map(|l| l.recipe))
    }
}

/// Parse a recipe from TOML. A missing `metadata.name` is filled from
/// `fallback_name`.
pub fn parse_recipe(toml_src: &str, fallback_name: &str) -> Result<Recipe> {
    let mut recipe: Recipe = toml::from_str(toml_src)?;
    if recipe.metadata.name.is_empty() {
        recipe.metadata.name = fallback_name.to_string();
    }
    Ok(recipe)
}

/// Parse a recipe file; the file stem is the fallback name.
pub fn parse_recipe_file(path: &Path) -> Result<Recipe> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    parse_recipe(&content, stem).map_err(|e| Error::recipe(stem, e.to_string()))
}

/// Tool names become file names; refuse anything that could escape.
fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !name.starts_with('.')
}

// ============================================================================
// Implementations
// ============================================================================

/// Recipes held in memory, keyed by `metadata.name`.
#[derive(Debug, Clone, Default)]
pub struct MemoryLoader {
    recipes: FxHashMap<String, Recipe>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, recipe: Recipe) {
        self.recipes.insert(recipe.name().to_string(), recipe);
    }

    pub fn with(mut self, recipe: Recipe) -> Self {
        self.insert(recipe);
        self
    }

    pub fn len(&self) -> usize {
        self.recipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipes.is_empty()
    }
}

impl RecipeLoader for MemoryLoader {
    fn locate(&self, name: &str) -> Result<Option<LoadedRecipe>> {
        Ok(self.recipes.get(name).map(|recipe| LoadedRecipe {
            recipe: recipe.clone(),
            source: "memory".to_string(),
        }))
    }
}

/// `<dir>/<name>.toml`
#[derive(Debug, Clone)]
pub struct DirLoader {
    dir: PathBuf,
}

impl DirLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl RecipeLoader for DirLoader {
    fn locate(&self, name: &str) -> Result<Option<LoadedRecipe>> {
        if !valid_name(name) {
            return Err(Error::recipe(name, "invalid recipe name"));
        }
        let path = self.dir.join(format!("{}.toml", name));
        if !path.is_file() {
            return Ok(None);
        }
        let recipe = parse_recipe_file(&path)?;
        Ok(Some(LoadedRecipe {
            recipe,
            source: path.display().to_string(),
        }))
    }
}

/// Recipes compiled into the binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbeddedLoader;

impl EmbeddedLoader {
    pub fn names() -> Vec<&'static str> {
        EMBEDDED.iter().map(|(name, _)| *name).collect()
    }
}

impl RecipeLoader for EmbeddedLoader {
    fn locate(&self, name: &str) -> Result<Option<LoadedRecipe>> {
        let Some((_, src)) = EMBEDDED.iter().find(|(n, _)| *n == name) else {
            return Ok(None);
        };
        let recipe = parse_recipe(src, name).map_err(|e| Error::recipe(name, e.to_string()))?;
        Ok(Some(LoadedRecipe {
            recipe,
            source: "embedded".to_string(),
        }))
    }
}

/// Ask each loader in turn; the first hit wins.
#[derive(Default)]
pub struct ChainLoader {
    loaders: Vec<Box<dyn RecipeLoader>>,
}

impl ChainLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, loader: impl RecipeLoader + 'static) -> Self {
        self.loaders.push(Box::new(loader));
        self
    }
}

impl RecipeLoader for ChainLoader {
    fn locate(&self, name: &str) -> Result<Option<LoadedRecipe>> {
        for loader in &self.loaders {
            if let Some(found) = loader.locate(name)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::RecipeType;

    const SAMPLE: &str = r#"
[metadata]
name = "sample"
type = "library"
extra_dependencies = ["zlib@1.3"]

[version]
source = "static"
versions = ["1.0.0"]

[[steps]]
action = "download_archive"
url = "https://example.com/sample-{version}.tar.gz"
binaries = ["sample"]
strip_dirs = 1
when = { os = ["linux"] }

[[steps]]
action = "run_command"
command = "echo hi"
dependencies = ["make"]
"#;

    #[test]
    fn test_parse_recipe_flattens_params() {
        let recipe = parse_recipe(SAMPLE, "ignored").unwrap();
        assert_eq!(recipe.name(), "sample");
        assert_eq!(recipe.metadata.recipe_type, RecipeType::Library);
        assert_eq!(recipe.steps.len(), 2);
        assert_eq!(recipe.steps[0].params["strip_dirs"], 1);
        assert_eq!(recipe.steps[0].when.os, vec!["linux"]);
        assert!(!recipe.steps[0].params.contains_key("when"));
        assert_eq!(
            recipe.steps[1].overrides().dependencies,
            Some(vec!["make".to_string()])
        );
    }

    #[test]
    fn test_parse_recipe_fills_missing_name() {
        let recipe = parse_recipe("[metadata]\n", "fallback").unwrap();
        assert_eq!(recipe.name(), "fallback");
    }

    #[test]
    fn test_parse_recipe_rejects_bad_toml() {
        assert!(parse_recipe("[metadata\nname=", "x").is_err());
    }

    #[test]
    fn test_dir_loader() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sample.toml"), SAMPLE).unwrap();
        let loader = DirLoader::new(dir.path());

        let found = loader.locate("sample").unwrap().unwrap();
        assert_eq!(found.recipe.name(), "sample");
        assert!(found.source.ends_with("sample.toml"));
        assert!(loader.load("missing").unwrap().is_none());
        assert!(loader.load("../etc/passwd").is_err());
    }

    #[test]
    fn test_embedded_recipes_parse() {
        for name in EmbeddedLoader::names() {
            let found = EmbeddedLoader.locate(name).unwrap().unwrap();
            assert_eq!(found.recipe.name(), name);
            assert_eq!(found.source, "embedded");
            assert!(!found.recipe.steps.is_empty(), "{name} has no steps");
        }
    }

    #[test]
    fn test_chain_loader_first_hit_wins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("jq.toml"),
            "[metadata]\nname = \"jq\"\ndescription = \"local override\"\n",
        )
        .unwrap();
        let chain = ChainLoader::new()
            .push(DirLoader::new(dir.path()))
            .push(EmbeddedLoader);

        let jq = chain.locate("jq").unwrap().unwrap();
        assert_eq!(jq.recipe.metadata.description.as_deref(), Some("local override"));
        let rg = chain.locate("ripgrep").unwrap().unwrap();
        assert_eq!(rg.source, "embedded");
        assert!(chain.locate("nonexistent").unwrap().is_none());
    }
}
