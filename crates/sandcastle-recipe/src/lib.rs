//! Build recipe resolution for sandbox images.
//!
//! [`resolve`] inspects a checked-out repository and produces a [`Recipe`]: the
//! detected [`Language`], a small dependency manifest, and the Dockerfile the image
//! is built from. A `Dockerfile` committed at the repository root always wins; when
//! there is none the Dockerfile is generated from a per-language template, and a
//! repository whose language cannot be classified is [`ResolveError::Unsupported`].
//!
//! Resolution is a pure function of the tree on disk. Nothing here talks to the
//! container engine.

mod detect;
mod dockerfile;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub use detect::{detect_dependencies, detect_language, has_dockerfile};
pub use dockerfile::generate_dockerfile;

/// Dependency manifest: free-form keys (`packages`, `scripts`, `build_tool`, ...) to values.
pub type Dependencies = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Node,
    Java,
    Go,
    Unknown,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Node => "node",
            Language::Java => "java",
            Language::Go => "go",
            Language::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the Dockerfile in a [`Recipe`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DockerfileSource {
    Repository,
    Generated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    pub language: Language,
    pub dependencies: Dependencies,
    pub dockerfile: String,
    pub dockerfile_source: DockerfileSource,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unsupported repository: {0}")]
    Unsupported(String),
    #[error("failed to read repository: {0}")]
    Io(#[from] std::io::Error),
}

pub fn resolve(repo_root: &Path) -> Result<Recipe, ResolveError> {
    if !repo_root.is_dir() {
        return Err(ResolveError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} is not a directory", repo_root.display()),
        )));
    }

    let language = detect_language(repo_root);
    let dependencies = detect_dependencies(repo_root, language);

    if has_dockerfile(repo_root) {
        let dockerfile = std::fs::read_to_string(repo_root.join("Dockerfile"))?;
        debug!(language = %language, "using repository Dockerfile");
        return Ok(Recipe {
            language,
            dependencies,
            dockerfile,
            dockerfile_source: DockerfileSource::Repository,
        });
    }

    let dockerfile = generate_dockerfile(language, repo_root).ok_or_else(|| {
        ResolveError::Unsupported(
            "no Dockerfile and no recognizable language manifest or source files".into(),
        )
    })?;
    debug!(language = %language, "generated Dockerfile");
    Ok(Recipe {
        language,
        dependencies,
        dockerfile,
        dockerfile_source: DockerfileSource::Generated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn repository_dockerfile_wins_over_generated_one() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("requirements.txt"), "flask\n").unwrap();
        fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();

        let recipe = resolve(dir.path()).unwrap();
        assert_eq!(recipe.language, Language::Python);
        assert_eq!(recipe.dockerfile, "FROM scratch\n");
        assert_eq!(recipe.dockerfile_source, DockerfileSource::Repository);
        assert_eq!(recipe.dependencies["packages"], vec!["flask".to_string()]);
    }

    #[test]
    fn dockerfile_alone_is_enough_for_unknown_language() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Dockerfile"), "FROM alpine\n").unwrap();
        fs::write(dir.path().join("README.md"), "hello").unwrap();

        let recipe = resolve(dir.path()).unwrap();
        assert_eq!(recipe.language, Language::Unknown);
        assert_eq!(recipe.dockerfile_source, DockerfileSource::Repository);
    }

    #[test]
    fn unknown_language_without_dockerfile_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("README.md"), "nothing to build").unwrap();

        let err = resolve(dir.path()).unwrap_err();
        assert!(matches!(err, ResolveError::Unsupported(_)));
        assert!(err.to_string().starts_with("unsupported repository"));
    }

    #[test]
    fn missing_root_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, ResolveError::Io(_)));
    }

    #[test]
    fn generated_recipe_for_go_module() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("go.mod"),
            "module example.com/x\n\nrequire github.com/a/b v1.0.0\n",
        )
        .unwrap();

        let recipe = resolve(dir.path()).unwrap();
        assert_eq!(recipe.language, Language::Go);
        assert_eq!(recipe.dockerfile_source, DockerfileSource::Generated);
        assert!(recipe.dockerfile.starts_with("FROM golang:1.21-alpine AS build"));
        assert_eq!(recipe.dependencies["has_go_mod"], vec!["true".to_string()]);
    }

    #[test]
    fn language_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Language::Node).unwrap(), "\"node\"");
        assert_eq!(Language::Unknown.to_string(), "unknown");
    }
}
