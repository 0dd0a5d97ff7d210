//! Tool dependency resolution.
//!
//! One level: a recipe's steps contribute their actions' declared deps,
//! adjusted by step overrides, then recipe-level overrides apply.
//! Transitive: each dependency's recipe is loaded and resolved the same way
//! until nothing new appears. The walk uses an explicit work stack and path
//! stack; the path is what cycle errors report.
//!
//! Install order over the resolved set uses Kahn's algorithm with
//! alphabetical tie-breaking for determinism.

use super::error::{Error, Result};
use super::recipe::RecipeLoader;
use super::types::{Recipe, ResolvedDeps, Step};
use crate::actions::ActionRegistry;
use rustc_hash::FxHashMap;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, VecDeque};
use tokio_util::sync::CancellationToken;

/// Levels below the root a dependency chain may reach.
pub const MAX_TRANSITIVE_DEPTH: usize = 14;

/// Split `name@version`; a bare name means `"latest"`.
pub fn parse_dependency(dep: &str) -> (String, String) {
    match dep.split_once('@') {
        Some((name, version)) if !version.trim().is_empty() => {
            (name.trim().to_string(), version.trim().to_string())
        }
        Some((name, _)) => (name.trim().to_string(), "latest".to_string()),
        None => (dep.trim().to_string(), "latest".to_string()),
    }
}

fn insert_all(into: &mut BTreeMap<String, String>, deps: &[String]) {
    for dep in deps {
        let (name, version) = parse_dependency(dep);
        into.insert(name, version);
    }
}

// ============================================================================
// Single recipe
// ============================================================================

/// Direct dependencies, cross-platform lists only.
pub fn resolve_dependencies(recipe: &Recipe, registry: &ActionRegistry) -> ResolvedDeps {
    resolve_dependencies_for_platform(recipe, registry, None)
}

/// Direct dependencies for `os`. `linux` and `darwin` add their platform
/// lists; anything else gets the cross-platform lists. Steps whose `when`
/// guard excludes `os` contribute nothing.
pub fn resolve_dependencies_for_platform(
    recipe: &Recipe,
    registry: &ActionRegistry,
    os: Option<&str>,
) -> ResolvedDeps {
    let mut install_time = BTreeMap::new();
    let mut runtime = BTreeMap::new();

    for step in &recipe.steps {
        if !step_applies(step, os) {
            continue;
        }
        let action_deps = registry.dependencies(&step.action);
        let overrides = step.overrides();

        match &overrides.dependencies {
            Some(replace) => insert_all(&mut install_time, replace),
            None => {
                for dep in action_deps.install_for(os) {
                    install_time.insert(dep, "latest".to_string());
                }
                insert_all(&mut install_time, &overrides.extra_dependencies);
            }
        }

        match &overrides.runtime_dependencies {
            Some(replace) => insert_all(&mut runtime, replace),
            None => {
                for dep in action_deps.runtime_for(os) {
                    runtime.insert(dep, "latest".to_string());
                }
                insert_all(&mut runtime, &overrides.extra_runtime_dependencies);
            }
        }
    }

    let meta = &recipe.metadata;
    if let Some(replace) = &meta.dependencies {
        install_time.clear();
        insert_all(&mut install_time, replace);
    }
    if let Some(replace) = &meta.runtime_dependencies {
        runtime.clear();
        insert_all(&mut runtime, replace);
    }
    insert_all(&mut install_time, &meta.extra_dependencies);
    insert_all(&mut runtime, &meta.extra_runtime_dependencies);

    ResolvedDeps {
        install_time,
        runtime,
    }
}

/// Whether a step's `when` guard admits `os`. Arch is not known here, so
/// only the OS half of a guard is consulted.
fn step_applies(step: &Step, os: Option<&str>) -> bool {
    let Some(os) = os else {
        return true;
    };
    let when = &step.when;
    if !when.platform.is_empty() {
        return when
            .platform
            .iter()
            .any(|tuple| tuple.split('/').next() == Some(os));
    }
    when.os.is_empty() || when.os.iter().any(|o| o == os)
}

// ============================================================================
// Transitive closure
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    InProgress,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timing {
    Install,
    Runtime,
}

struct Frame {
    name: String,
    children: Vec<String>,
    next: usize,
}

/// Transitive closure of `deps`, cross-platform lists only.
pub fn resolve_transitive(
    loader: &dyn RecipeLoader,
    registry: &ActionRegistry,
    deps: &ResolvedDeps,
    root: &str,
    cancel: &CancellationToken,
) -> Result<ResolvedDeps> {
    resolve_transitive_for_platform(loader, registry, deps, root, None, cancel)
}

/// Transitive closure of `deps` with the platform filter applied at every
/// level. Install-time deps expand through install-time sets, runtime deps
/// through runtime sets.
pub fn resolve_transitive_for_platform(
    loader: &dyn RecipeLoader,
    registry: &ActionRegistry,
    deps: &ResolvedDeps,
    root: &str,
    os: Option<&str>,
    cancel: &CancellationToken,
) -> Result<ResolvedDeps> {
    let install_time = closure(loader, registry, &deps.install_time, root, os, Timing::Install, cancel)?;
    let runtime = closure(loader, registry, &deps.runtime, root, os, Timing::Runtime, cancel)?;
    Ok(ResolvedDeps {
        install_time,
        runtime,
    })
}

fn closure(
    loader: &dyn RecipeLoader,
    registry: &ActionRegistry,
    initial: &BTreeMap<String, String>,
    root: &str,
    os: Option<&str>,
    timing: Timing,
    cancel: &CancellationToken,
) -> Result<BTreeMap<String, String>> {
    let mut result = initial.clone();
    let mut arena: FxHashMap<String, Visit> = FxHashMap::default();
    let mut path: Vec<String> = vec![root.to_string()];
    arena.insert(root.to_string(), Visit::InProgress);

    let mut stack = vec![Frame {
        name: root.to_string(),
        children: initial.keys().cloned().collect(),
        next: 0,
    }];

    while let Some(frame) = stack.last_mut() {
        if frame.next >= frame.children.len() {
            let name = frame.name.clone();
            stack.pop();
            path.pop();
            arena.insert(name, Visit::Done);
            continue;
        }
        let child = frame.children[frame.next].clone();
        frame.next += 1;

        match arena.get(&child) {
            Some(Visit::InProgress) => {
                let mut cycle = path.clone();
                cycle.push(child);
                return Err(Error::CyclicDependency { path: cycle });
            }
            Some(Visit::Done) => continue,
            None => {}
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let Some(recipe) = loader.load(&child)? else {
            tracing::debug!(tool = %child, parent = %path.join(" -> "), "no recipe for dependency; not expanded");
            arena.insert(child, Visit::Done);
            continue;
        };

        if path.len() > MAX_TRANSITIVE_DEPTH {
            let mut chain = path.clone();
            chain.push(child);
            return Err(Error::MaxDepthExceeded {
                limit: MAX_TRANSITIVE_DEPTH,
                path: chain,
            });
        }

        let resolved = resolve_dependencies_for_platform(&recipe, registry, os);
        let next = match timing {
            Timing::Install => resolved.install_time,
            Timing::Runtime => resolved.runtime,
        };

        // Merge the whole level before descending so nearer declarations
        // win over deeper ones.
        for (name, version) in &next {
            match result.entry(name.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(version.clone());
                }
                Entry::Occupied(existing) if existing.get() != version => {
                    tracing::warn!(
                        tool = %name,
                        kept = %existing.get(),
                        ignored = %version,
                        required_by = %child,
                        "conflicting dependency versions; keeping the first"
                    );
                }
                Entry::Occupied(_) => {}
            }
        }

        arena.insert(child.clone(), Visit::InProgress);
        path.push(child.clone());
        stack.push(Frame {
            name: child,
            children: next.into_keys().collect(),
            next: 0,
        });
    }

    Ok(result)
}

// ============================================================================
// Install order
// ============================================================================

/// Install-time edges among `tools`: tool → the tools it needs first.
/// Tools without a recipe have no edges.
pub fn install_graph(
    loader: &dyn RecipeLoader,
    registry: &ActionRegistry,
    tools: &BTreeMap<String, String>,
    os: Option<&str>,
) -> Result<BTreeMap<String, Vec<String>>> {
    let mut graph = BTreeMap::new();
    for tool in tools.keys() {
        let needs = match loader.load(tool)? {
            Some(recipe) => resolve_dependencies_for_platform(&recipe, registry, os)
                .install_time
                .into_keys()
                .filter(|dep| tools.contains_key(dep) && dep != tool)
                .collect(),
            None => Vec::new(),
        };
        graph.insert(tool.clone(), needs);
    }
    Ok(graph)
}

/// Topological order (dependencies first) using Kahn's algorithm with
/// alphabetical tie-breaking.
pub fn install_order(graph: &BTreeMap<String, Vec<String>>) -> Result<Vec<String>> {
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for (tool, needs) in graph {
        in_degree.entry(tool.as_str()).or_insert(0);
        for dep in needs {
            in_degree.entry(dep.as_str()).or_insert(0);
            *in_degree.entry(tool.as_str()).or_insert(0) += 1;
            dependents.entry(dep.as_str()).or_default().push(tool.as_str());
        }
    }

    // BTreeMap iteration is already sorted
    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(t, _)| *t)
        .collect();

    let mut order = Vec::new();
    while let Some(current) = queue.pop_front() {
        order.push(current.to_string());

        let mut next_ready: Vec<&str> = Vec::new();
        for dependent in dependents.get(current).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    next_ready.push(*dependent);
                }
            }
        }
        next_ready.sort_unstable();
        queue.extend(next_ready);
    }

    if order.len() != in_degree.len() {
        let members: Vec<String> = in_degree
            .iter()
            .filter(|(_, &d)| d > 0)
            .map(|(t, _)| t.to_string())
            .collect();
        return Err(Error::CyclicDependency { path: members });
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{Action, ActionDeps, ExecutionContext};
    use crate::core::error::ErrorKind;
    use crate::core::recipe::MemoryLoader;
    use crate::core::types::{Metadata, Params};
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::sync::Arc;

    /// Declares one dependency of every platform flavor.
    struct TestPlatformAction;

    #[async_trait]
    impl Action for TestPlatformAction {
        fn name(&self) -> &'static str {
            "test_platform"
        }
        fn dependencies(&self) -> ActionDeps {
            ActionDeps {
                install_time: vec!["common-tool".into()],
                runtime: vec!["common-runtime".into()],
                linux_install_time: vec!["patchelf".into()],
                darwin_install_time: vec!["macos-tool".into()],
                linux_runtime: vec!["glibc-shim".into()],
                ..ActionDeps::default()
            }
        }
        async fn execute(&self, _ctx: &ExecutionContext, _params: &Params) -> Result<()> {
            Ok(())
        }
    }

    fn registry() -> ActionRegistry {
        let mut registry = ActionRegistry::builtin();
        registry.register(Arc::new(TestPlatformAction));
        registry
    }

    fn recipe(name: &str, deps: &[&str]) -> Recipe {
        Recipe {
            metadata: Metadata {
                name: name.to_string(),
                dependencies: Some(deps.iter().map(|d| d.to_string()).collect()),
                ..Metadata::default()
            },
            steps: vec![Step::new("download").with_param("url", "https://example.com/x")],
            ..Recipe::default()
        }
    }

    fn install_deps(pairs: &[(&str, &str)]) -> ResolvedDeps {
        ResolvedDeps {
            install_time: pairs
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
            runtime: BTreeMap::new(),
        }
    }

    fn keys(map: &BTreeMap<String, String>) -> Vec<&str> {
        map.keys().map(String::as_str).collect()
    }

    // -- parse_dependency ----------------------------------------------------

    #[test]
    fn test_parse_dependency() {
        assert_eq!(parse_dependency("nodejs"), ("nodejs".into(), "latest".into()));
        assert_eq!(parse_dependency("nodejs@20"), ("nodejs".into(), "20".into()));
        assert_eq!(parse_dependency("nodejs@"), ("nodejs".into(), "latest".into()));
        assert_eq!(
            parse_dependency("scoped@1.0@extra"),
            ("scoped".into(), "1.0@extra".into())
        );
    }

    // -- single recipe -------------------------------------------------------

    #[test]
    fn test_npm_install_implies_nodejs() {
        let r = Recipe {
            steps: vec![Step::new("npm_install").with_param("package", "prettier")],
            ..Recipe::default()
        };
        let deps = resolve_dependencies(&r, &registry());
        assert_eq!(keys(&deps.install_time), vec!["nodejs"]);
        assert_eq!(deps.runtime["nodejs"], "latest");
    }

    #[test]
    fn test_platform_filtering_is_exact() {
        let r = Recipe {
            steps: vec![Step::new("test_platform")],
            ..Recipe::default()
        };
        let reg = registry();

        let linux = resolve_dependencies_for_platform(&r, &reg, Some("linux"));
        assert_eq!(keys(&linux.install_time), vec!["common-tool", "patchelf"]);
        assert_eq!(keys(&linux.runtime), vec!["common-runtime", "glibc-shim"]);

        let darwin = resolve_dependencies_for_platform(&r, &reg, Some("darwin"));
        assert_eq!(keys(&darwin.install_time), vec!["common-tool", "macos-tool"]);
        assert_eq!(keys(&darwin.runtime), vec!["common-runtime"]);

        let other = resolve_dependencies_for_platform(&r, &reg, Some("freebsd"));
        assert_eq!(keys(&other.install_time), vec!["common-tool"]);
        assert_eq!(resolve_dependencies(&r, &reg), other);
    }

    #[test]
    fn test_step_replace_drops_platform_lists() {
        let r = Recipe {
            steps: vec![Step::new("test_platform")
                .with_param("dependencies", serde_json::json!(["only-this@2.0"]))],
            ..Recipe::default()
        };
        let deps = resolve_dependencies_for_platform(&r, &registry(), Some("linux"));
        assert_eq!(keys(&deps.install_time), vec!["only-this"]);
        assert_eq!(deps.install_time["only-this"], "2.0");
        // runtime side untouched
        assert_eq!(keys(&deps.runtime), vec!["common-runtime", "glibc-shim"]);
    }

    #[test]
    fn test_step_extend_adds_to_implicit() {
        let r = Recipe {
            steps: vec![Step::new("npm_install")
                .with_param("extra_dependencies", serde_json::json!(["python@3.12"]))
                .with_param("extra_runtime_dependencies", "bash")],
            ..Recipe::default()
        };
        let deps = resolve_dependencies(&r, &registry());
        assert_eq!(keys(&deps.install_time), vec!["nodejs", "python"]);
        assert_eq!(deps.install_time["python"], "3.12");
        assert_eq!(keys(&deps.runtime), vec!["bash", "nodejs"]);
    }

    #[test]
    fn test_recipe_replace_then_extend() {
        let r = Recipe {
            metadata: Metadata {
                name: "t".into(),
                dependencies: Some(vec!["cmake".into()]),
                extra_dependencies: vec!["ninja@1.11".into()],
                runtime_dependencies: Some(vec![]),
                ..Metadata::default()
            },
            steps: vec![Step::new("npm_install")],
            ..Recipe::default()
        };
        let deps = resolve_dependencies(&r, &registry());
        assert_eq!(keys(&deps.install_time), vec!["cmake", "ninja"]);
        assert!(deps.runtime.is_empty());
    }

    #[test]
    fn test_when_guard_excludes_steps() {
        let mut darwin_only = Step::new("npm_install");
        darwin_only.when.os = vec!["darwin".into()];
        let mut linux_tuple = Step::new("cargo_install");
        linux_tuple.when.platform = vec!["linux/arm64".into()];
        let r = Recipe {
            steps: vec![darwin_only, linux_tuple],
            ..Recipe::default()
        };
        let reg = registry();
        assert_eq!(
            keys(&resolve_dependencies_for_platform(&r, &reg, Some("linux")).install_time),
            vec!["rust"]
        );
        assert_eq!(
            keys(&resolve_dependencies_for_platform(&r, &reg, Some("darwin")).install_time),
            vec!["nodejs"]
        );
        assert_eq!(
            keys(&resolve_dependencies(&r, &reg).install_time),
            vec!["nodejs", "rust"]
        );
    }

    #[test]
    fn test_empty_recipe() {
        assert!(resolve_dependencies(&Recipe::default(), &registry()).is_empty());
    }

    // -- transitive ----------------------------------------------------------

    fn transitive(loader: &MemoryLoader, deps: &ResolvedDeps, root: &str) -> Result<ResolvedDeps> {
        resolve_transitive(loader, &registry(), deps, root, &CancellationToken::new())
    }

    #[test]
    fn test_transitive_empty() {
        let out = transitive(&MemoryLoader::new(), &ResolvedDeps::default(), "root").unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_transitive_linear_chain() {
        let loader = MemoryLoader::new().with(recipe("B", &["C"])).with(recipe("C", &[]));
        let out = transitive(&loader, &install_deps(&[("B", "latest")]), "A").unwrap();
        assert_eq!(keys(&out.install_time), vec!["B", "C"]);
    }

    #[test]
    fn test_transitive_diamond_converges() {
        let loader = MemoryLoader::new()
            .with(recipe("B", &["D"]))
            .with(recipe("C", &["D"]))
            .with(recipe("D", &[]));
        let out = transitive(&loader, &install_deps(&[("B", "latest"), ("C", "latest")]), "A").unwrap();
        assert_eq!(keys(&out.install_time), vec!["B", "C", "D"]);
    }

    #[test]
    fn test_transitive_cycle_reports_path() {
        let loader = MemoryLoader::new()
            .with(recipe("A", &["B"]))
            .with(recipe("B", &["C"]))
            .with(recipe("C", &["A"]));
        let err = transitive(&loader, &install_deps(&[("B", "latest")]), "A").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CyclicDependency);
        assert_eq!(err.to_string(), "cyclic dependency detected: A -> B -> C -> A");
    }

    #[test]
    fn test_transitive_self_cycle() {
        let loader = MemoryLoader::new().with(recipe("A", &["A"]));
        let err = transitive(&loader, &install_deps(&[("A", "latest")]), "root").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CyclicDependency);
        assert!(err.to_string().ends_with("root -> A -> A"));
    }

    fn chain(len: usize) -> MemoryLoader {
        let mut loader = MemoryLoader::new();
        for i in 0..len {
            let next = format!("D{}", i + 1);
            let deps: Vec<&str> = if i + 1 < len { vec![next.as_str()] } else { vec![] };
            loader.insert(recipe(&format!("D{}", i), &deps));
        }
        loader
    }

    #[test]
    fn test_transitive_max_depth_exceeded() {
        // root -> D0 -> ... -> D14 is fifteen levels
        let err = transitive(&chain(15), &install_deps(&[("D0", "latest")]), "root").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MaxDepthExceeded);
        assert!(err.to_string().contains("D14"));
    }

    #[test]
    fn test_transitive_at_depth_limit_succeeds() {
        let out = transitive(&chain(14), &install_deps(&[("D0", "latest")]), "root").unwrap();
        assert_eq!(out.install_time.len(), 14);
    }

    #[test]
    fn test_transitive_first_version_wins() {
        let loader = MemoryLoader::new()
            .with(recipe("B", &["C@2.0"]))
            .with(recipe("C", &[]));
        let out = transitive(&loader, &install_deps(&[("B", "latest"), ("C", "1.0")]), "root").unwrap();
        assert_eq!(out.install_time["C"], "1.0");
    }

    #[test]
    fn test_transitive_nearer_declaration_wins() {
        // B needs X and Y@1; X needs Y@2. Y@1 sits one level closer.
        let loader = MemoryLoader::new()
            .with(recipe("B", &["X", "Y@1"]))
            .with(recipe("X", &["Y@2"]))
            .with(recipe("Y", &[]));
        let out = transitive(&loader, &install_deps(&[("B", "latest")]), "root").unwrap();
        assert_eq!(out.install_time["Y"], "1");
    }

    #[test]
    fn test_transitive_missing_recipe_kept() {
        let out = transitive(&MemoryLoader::new(), &install_deps(&[("missing-tool", "latest")]), "root").unwrap();
        assert_eq!(out.install_time["missing-tool"], "latest");
    }

    #[test]
    fn test_transitive_runtime_expands_runtime_sets() {
        let mut prettier = recipe("prettier", &[]);
        prettier.metadata.dependencies = None;
        prettier.steps = vec![Step::new("npm_install")];
        let mut nodejs = recipe("nodejs", &[]);
        nodejs.metadata.runtime_dependencies = Some(vec!["openssl@3".into()]);
        let loader = MemoryLoader::new().with(prettier).with(nodejs);

        let direct = ResolvedDeps {
            install_time: BTreeMap::new(),
            runtime: [("prettier".to_string(), "latest".to_string())].into(),
        };
        let out = transitive(&loader, &direct, "root").unwrap();
        assert_eq!(keys(&out.runtime), vec!["nodejs", "openssl", "prettier"]);
        assert!(out.install_time.is_empty());
    }

    #[test]
    fn test_transitive_platform_applied_at_every_level() {
        let mut mid = recipe("mid", &[]);
        mid.metadata.dependencies = None;
        mid.steps = vec![Step::new("test_platform")];
        let loader = MemoryLoader::new().with(mid);
        let reg = registry();
        let deps = install_deps(&[("mid", "latest")]);
        let cancel = CancellationToken::new();

        let linux = resolve_transitive_for_platform(&loader, &reg, &deps, "root", Some("linux"), &cancel).unwrap();
        assert_eq!(keys(&linux.install_time), vec!["common-tool", "mid", "patchelf"]);
        let darwin = resolve_transitive_for_platform(&loader, &reg, &deps, "root", Some("darwin"), &cancel).unwrap();
        assert_eq!(keys(&darwin.install_time), vec!["common-tool", "macos-tool", "mid"]);
    }

    #[test]
    fn test_transitive_cancelled() {
        let loader = MemoryLoader::new().with(recipe("B", &[]));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = resolve_transitive(&loader, &registry(), &install_deps(&[("B", "latest")]), "A", &cancel)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    // -- install order -------------------------------------------------------

    #[test]
    fn test_install_order_dependencies_first() {
        let loader = MemoryLoader::new()
            .with(recipe("B", &["D"]))
            .with(recipe("C", &["D"]))
            .with(recipe("D", &[]));
        let tools: BTreeMap<String, String> = ["B", "C", "D"]
            .iter()
            .map(|t| (t.to_string(), "latest".to_string()))
            .collect();
        let graph = install_graph(&loader, &registry(), &tools, None).unwrap();
        assert_eq!(install_order(&graph).unwrap(), vec!["D", "B", "C"]);
    }

    #[test]
    fn test_install_order_alphabetical_ties() {
        let graph: BTreeMap<String, Vec<String>> = [
            ("zeta".to_string(), vec![]),
            ("alpha".to_string(), vec![]),
            ("mid".to_string(), vec!["zeta".to_string()]),
        ]
        .into();
        assert_eq!(install_order(&graph).unwrap(), vec!["alpha", "zeta", "mid"]);
    }

    #[test]
    fn test_install_order_cycle() {
        let graph: BTreeMap<String, Vec<String>> = [
            ("a".to_string(), vec!["b".to_string()]),
            ("b".to_string(), vec!["a".to_string()]),
        ]
        .into();
        let err = install_order(&graph).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CyclicDependency);
    }

    // -- properties ----------------------------------------------------------

    proptest! {
        /// On any DAG the closure is exactly the reachable set.
        #[test]
        fn prop_closure_is_reachable_set(edges in proptest::collection::vec((0usize..8, 0usize..8), 0..20)) {
            let mut adjacency: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
            for (a, b) in edges {
                let (lo, hi) = if a < b { (a, b) } else if b < a { (b, a) } else { continue };
                adjacency.entry(lo).or_default().push(hi);
            }
            let mut loader = MemoryLoader::new();
            for i in 0..8 {
                let deps: Vec<String> = adjacency.get(&i).into_iter().flatten().map(|d| format!("t{}", d)).collect();
                let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
                loader.insert(recipe(&format!("t{}", i), &deps));
            }

            let mut reachable = std::collections::BTreeSet::new();
            let mut queue = vec![0usize];
            while let Some(n) = queue.pop() {
                for &m in adjacency.get(&n).into_iter().flatten() {
                    if reachable.insert(m) {
                        queue.push(m);
                    }
                }
            }

            let direct = resolve_dependencies(&loader.load("t0").unwrap().unwrap(), &registry());
            let out = transitive(&loader, &direct, "t0").unwrap();
            let got: std::collections::BTreeSet<usize> = out
                .install_time
                .keys()
                .map(|k| k[1..].parse().unwrap())
                .collect();
            prop_assert_eq!(got, reachable);
        }
    }
}
