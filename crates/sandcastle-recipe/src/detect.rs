use std::fs;
use std::path::Path;

use walkdir::WalkDir;

use crate::{Dependencies, Language};

const MANIFESTS: &[(Language, &[&str])] = &[
    (
        Language::Python,
        &["requirements.txt", "setup.py", "pyproject.toml", "Pipfile"],
    ),
    (
        Language::Node,
        &["package.json", "package-lock.json", "yarn.lock"],
    ),
    (
        Language::Java,
        &["pom.xml", "build.gradle", "build.gradle.kts"],
    ),
    (Language::Go, &["go.mod", "go.sum"]),
];

const EXTENSIONS: &[(&str, Language)] = &[
    ("py", Language::Python),
    ("js", Language::Node),
    ("ts", Language::Node),
    ("java", Language::Java),
    ("go", Language::Go),
];

/// Manifest files at the root decide first (in table order); otherwise the first
/// source file with a known extension, walking the tree in name order.
pub fn detect_language(repo_root: &Path) -> Language {
    for (language, files) in MANIFESTS {
        if files.iter().any(|name| repo_root.join(name).is_file()) {
            return *language;
        }
    }

    let walker = WalkDir::new(repo_root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.file_name() != ".git");
    for entry in walker.filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(ext) = entry.path().extension().and_then(|ext| ext.to_str()) else {
            continue;
        };
        if let Some((_, language)) = EXTENSIONS.iter().find(|(known, _)| *known == ext) {
            return *language;
        }
    }

    Language::Unknown
}

pub fn detect_dependencies(repo_root: &Path, language: Language) -> Dependencies {
    match language {
        Language::Python => python_dependencies(repo_root),
        Language::Node => node_dependencies(repo_root),
        Language::Java => java_dependencies(repo_root),
        Language::Go => go_dependencies(repo_root),
        Language::Unknown => Dependencies::new(),
    }
}

pub fn has_dockerfile(repo_root: &Path) -> bool {
    repo_root.join("Dockerfile").is_file()
}

fn marker() -> Vec<String> {
    vec!["true".to_string()]
}

fn python_dependencies(repo_root: &Path) -> Dependencies {
    let mut deps = Dependencies::new();
    let packages = fs::read_to_string(repo_root.join("requirements.txt"))
        .map(|contents| {
            contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    deps.insert("packages".into(), packages);
    if repo_root.join("setup.py").is_file() {
        deps.insert("has_setup_py".into(), marker());
    }
    if repo_root.join("pyproject.toml").is_file() {
        deps.insert("has_pyproject_toml".into(), marker());
    }
    deps
}

fn node_dependencies(repo_root: &Path) -> Dependencies {
    let mut deps = Dependencies::new();
    deps.insert("packages".into(), Vec::new());
    let Ok(raw) = fs::read_to_string(repo_root.join("package.json")) else {
        return deps;
    };
    let manifest: serde_json::Value = match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(_) => {
            deps.insert("error".into(), vec!["Invalid package.json".into()]);
            return deps;
        }
    };
    for key in ["dependencies", "devDependencies", "scripts"] {
        if let Some(table) = manifest.get(key).and_then(|value| value.as_object()) {
            deps.insert(key.into(), table.keys().cloned().collect());
        }
    }
    deps
}

fn java_dependencies(repo_root: &Path) -> Dependencies {
    let mut deps = Dependencies::new();
    if repo_root.join("pom.xml").is_file() {
        deps.insert("build_tool".into(), vec!["maven".into()]);
    }
    if is_gradle(repo_root) {
        deps.insert("build_tool".into(), vec!["gradle".into()]);
    }
    deps
}

fn go_dependencies(repo_root: &Path) -> Dependencies {
    let mut deps = Dependencies::new();
    deps.insert("packages".into(), Vec::new());
    let requires = fs::read_to_string(repo_root.join("go.mod"))
        .map(|contents| {
            contents
                .lines()
                .any(|line| line.trim().starts_with("require"))
        })
        .unwrap_or(false);
    if requires {
        deps.insert("has_go_mod".into(), marker());
    }
    deps
}

pub(crate) fn is_gradle(repo_root: &Path) -> bool {
    repo_root.join("build.gradle").is_file() || repo_root.join("build.gradle.kts").is_file()
}
