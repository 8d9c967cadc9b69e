//! Dependency extraction from Python project manifests.
//!
//! Two formats are understood: Poetry's `pyproject.toml` (the
//! `[tool.poetry.dependencies]` table) and pip's `requirements.txt`. The first
//! one present in the workspace root wins, probed in that order.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use toml::{Table, Value};
use tracing::{debug, info, instrument};

use crate::constants::{LISTING_SEPARATOR, PYPROJECT_FILE, REQUIREMENTS_FILE};
use crate::error::{Result, SnkrError};

const POETRY_DEPENDENCY_PATH: [&str; 3] = ["tool", "poetry", "dependencies"];

/// Constraint recorded for a requirement with no version specifier.
const ANY_VERSION: &str = "*";

/// Folders open in the current session. Only the first one is consulted.
#[derive(Debug, Clone, Default)]
pub struct Workspace {
    pub roots: Vec<PathBuf>,
}

impl Workspace {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    pub fn single(root: impl Into<PathBuf>) -> Self {
        Self {
            roots: vec![root.into()],
        }
    }

    pub fn first_root(&self) -> Result<&Path> {
        self.roots
            .first()
            .map(PathBuf::as_path)
            .ok_or(SnkrError::NoWorkspace)
    }
}

/// Dependency name to version constraint, in manifest order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyTable {
    entries: Vec<(String, String)>,
}

impl DependencyTable {
    pub fn push(&mut self, name: impl Into<String>, version: impl Into<String>) {
        self.entries.push((name.into(), version.into()));
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn listing(&self) -> DependencyListing {
        DependencyListing(
            self.entries
                .iter()
                .map(|(name, version)| format!("{}: {}", name, version))
                .collect::<Vec<_>>()
                .join(LISTING_SEPARATOR),
        )
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for DependencyTable {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut table = DependencyTable::default();
        for (name, version) in iter {
            table.push(name, version);
        }
        table
    }
}

/// Flat `name: version` rendering handed to the model as context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyListing(String);

impl DependencyListing {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DependencyListing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A manifest format that can be found in a workspace root and parsed.
pub trait ManifestFormat: Send + Sync {
    fn file_name(&self) -> &'static str;

    /// Path of this manifest under `root`, if it exists.
    fn detect(&self, root: &Path) -> Option<PathBuf> {
        let path = root.join(self.file_name());
        path.is_file().then_some(path)
    }

    fn parse(&self, path: &Path, contents: &str) -> Result<DependencyTable>;
}

/// `pyproject.toml` with a `[tool.poetry.dependencies]` table.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoetryManifest;

impl ManifestFormat for PoetryManifest {
    fn file_name(&self) -> &'static str {
        PYPROJECT_FILE
    }

    fn parse(&self, path: &Path, contents: &str) -> Result<DependencyTable> {
        let document: Table = contents.parse().map_err(|source| SnkrError::ManifestParse {
            path: path.to_path_buf(),
            source,
        })?;
        let dependencies = poetry_dependencies(&document, path)?;
        Ok(dependencies
            .iter()
            .map(|(name, value)| (name.clone(), render_constraint(value)))
            .collect())
    }
}

/// Walk `tool.poetry.dependencies`, reporting the first level that is missing.
fn poetry_dependencies<'a>(document: &'a Table, path: &Path) -> Result<&'a Table> {
    let mut current = document;
    for (depth, key) in POETRY_DEPENDENCY_PATH.iter().enumerate() {
        current = current
            .get(*key)
            .and_then(Value::as_table)
            .ok_or_else(|| SnkrError::ManifestShape {
                path: path.to_path_buf(),
                key: POETRY_DEPENDENCY_PATH[..=depth].join("."),
            })?;
    }
    Ok(current)
}

/// Poetry allows `name = "^1.0"` as well as `name = { version = "^1.0", ... }`.
fn render_constraint(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Table(table) => match table.get("version") {
            Some(version) => render_constraint(version),
            None => value.to_string(),
        },
        other => other.to_string(),
    }
}

/// pip `requirements.txt`: one requirement per line.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequirementsManifest;

impl ManifestFormat for RequirementsManifest {
    fn file_name(&self) -> &'static str {
        REQUIREMENTS_FILE
    }

    fn parse(&self, _path: &Path, contents: &str) -> Result<DependencyTable> {
        Ok(contents.lines().filter_map(parse_requirement).collect())
    }
}

/// Split a requirement line into name and constraint.
///
/// Comments, blank lines and pip options (`-r`, `-e`, `--index-url`) yield `None`.
/// Environment markers after `;` are dropped.
fn parse_requirement(line: &str) -> Option<(String, String)> {
    let line = strip_comment(line);
    let line = line.split(';').next().unwrap_or_default().trim();
    if line.is_empty() || line.starts_with('-') {
        return None;
    }

    match line.find(|c: char| matches!(c, '=' | '<' | '>' | '!' | '~' | '@')) {
        Some(idx) => {
            let name = line[..idx].trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), line[idx..].trim().to_string()))
        }
        None => Some((line.to_string(), ANY_VERSION.to_string())),
    }
}

/// A `#` starts a comment only at the start of a line or after whitespace,
/// so URL fragments such as `#sha256=...` survive.
fn strip_comment(line: &str) -> &str {
    line.char_indices()
        .find(|&(idx, c)| c == '#' && (idx == 0 || line[..idx].ends_with(char::is_whitespace)))
        .map_or(line, |(idx, _)| &line[..idx])
}

/// Formats probed by [`load_dependencies`], highest priority first.
pub fn default_formats() -> Vec<Box<dyn ManifestFormat>> {
    vec![Box::new(PoetryManifest), Box::new(RequirementsManifest)]
}

/// Find the first manifest present in the workspace root and parse it.
///
/// When none of `formats` is present the error names the first (preferred) one.
#[instrument(skip(workspace, formats))]
pub fn extract_dependencies(
    workspace: &Workspace,
    formats: &[Box<dyn ManifestFormat>],
) -> Result<(PathBuf, DependencyTable)> {
    let root = workspace.first_root()?;

    for format in formats {
        if let Some(path) = format.detect(root) {
            debug!(path = %path.display(), "Found manifest");
            let contents = fs::read_to_string(&path).map_err(|source| SnkrError::Io {
                path: path.clone(),
                source,
            })?;
            let table = format.parse(&path, &contents)?;
            info!(path = %path.display(), count = table.len(), "Loaded dependencies");
            return Ok((path, table));
        }
    }

    let expected = formats
        .first()
        .map(|format| root.join(format.file_name()))
        .unwrap_or_else(|| root.join(PYPROJECT_FILE));
    Err(SnkrError::ManifestNotFound { path: expected })
}

/// Dependency listing from whichever supported manifest the workspace has.
pub fn load_dependencies(workspace: &Workspace) -> Result<DependencyListing> {
    let (_, table) = extract_dependencies(workspace, &default_formats())?;
    Ok(table.listing())
}

/// Dependency listing from `pyproject.toml` only.
pub fn load_poetry_dependencies(workspace: &Workspace) -> Result<DependencyListing> {
    let formats: Vec<Box<dyn ManifestFormat>> = vec![Box::new(PoetryManifest)];
    let (_, table) = extract_dependencies(workspace, &formats)?;
    Ok(table.listing())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_poetry(contents: &str) -> Result<DependencyTable> {
        PoetryManifest.parse(Path::new("pyproject.toml"), contents)
    }

    #[test]
    fn test_listing_joins_without_trailing_separator() {
        let table: DependencyTable = [("requests", "^2.31"), ("numpy", "^1.26")]
            .into_iter()
            .collect();
        assert_eq!(table.listing().as_str(), "requests: ^2.31, \nnumpy: ^1.26");
    }

    #[test]
    fn test_listing_single_entry_is_untouched() {
        let table: DependencyTable = [("a", "1")].into_iter().collect();
        assert_eq!(table.listing().as_str(), "a: 1");
    }

    #[test]
    fn test_listing_empty_table() {
        assert!(DependencyTable::default().listing().is_empty());
    }

    #[test]
    fn test_listing_has_one_line_per_entry() {
        let table: DependencyTable = (0..5).map(|i| (format!("pkg{}", i), format!("^{}.0", i))).collect();
        let listing = table.listing();
        let lines: Vec<&str> = listing.as_str().split(LISTING_SEPARATOR).collect();
        assert_eq!(lines.len(), 5);
        for (i, line) in lines.iter().enumerate() {
            assert_eq!(*line, format!("pkg{}: ^{}.0", i, i));
        }
    }

    #[test]
    fn test_poetry_preserves_manifest_order() {
        let table = parse_poetry(
            r#"
[tool.poetry.dependencies]
python = "^3.11"
requests = "^2.31"
aiohttp = "^3.9"
"#,
        )
        .unwrap();
        let names: Vec<&str> = table.entries().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["python", "requests", "aiohttp"]);
    }

    #[test]
    fn test_poetry_renders_detailed_and_scalar_constraints() {
        let table = parse_poetry(
            r#"
[tool.poetry.dependencies]
uvicorn = { version = "^0.29", extras = ["standard"] }
mylib = { git = "https://example.com/mylib.git" }
pinned = 3
"#,
        )
        .unwrap();
        assert_eq!(table.entries()[0], ("uvicorn".to_string(), "^0.29".to_string()));
        assert!(table.entries()[1].1.contains("https://example.com/mylib.git"));
        assert_eq!(table.entries()[2].1, "3");
    }

    #[test]
    fn test_poetry_missing_section_names_the_key() {
        let err = parse_poetry("[tool.black]\nline-length = 100\n").unwrap_err();
        match err {
            SnkrError::ManifestShape { key, .. } => assert_eq!(key, "tool.poetry"),
            other => panic!("unexpected error: {other:?}"),
        }

        let err = parse_poetry("[project]\nname = \"x\"\n").unwrap_err();
        assert!(matches!(err, SnkrError::ManifestShape { ref key, .. } if key == "tool"));

        let err = parse_poetry("[tool.poetry]\nname = \"x\"\n").unwrap_err();
        assert!(matches!(err, SnkrError::ManifestShape { ref key, .. } if key == "tool.poetry.dependencies"));
    }

    #[test]
    fn test_poetry_non_table_level_is_a_shape_error() {
        let err = parse_poetry("[tool]\npoetry = \"nope\"\n").unwrap_err();
        assert!(matches!(err, SnkrError::ManifestShape { ref key, .. } if key == "tool.poetry"));
    }

    #[test]
    fn test_poetry_invalid_toml() {
        let err = parse_poetry("[tool.poetry.dependencies\nrequests = ").unwrap_err();
        assert!(matches!(err, SnkrError::ManifestParse { .. }));
    }

    #[test]
    fn test_parse_requirement_lines() {
        assert_eq!(
            parse_requirement("requests==2.31.0"),
            Some(("requests".to_string(), "==2.31.0".to_string()))
        );
        assert_eq!(
            parse_requirement("numpy >= 1.26, <2  # pinned below 2"),
            Some(("numpy".to_string(), ">= 1.26, <2".to_string()))
        );
        assert_eq!(
            parse_requirement("flask"),
            Some(("flask".to_string(), "*".to_string()))
        );
        assert_eq!(
            parse_requirement("pywin32==306; sys_platform == 'win32'"),
            Some(("pywin32".to_string(), "==306".to_string()))
        );
        assert_eq!(
            parse_requirement("pkg @ https://host/pkg.zip#sha256=abc123"),
            Some(("pkg".to_string(), "@ https://host/pkg.zip#sha256=abc123".to_string()))
        );
        assert_eq!(
            parse_requirement("pkg @ https://host/pkg.zip#sha256=abc123 # vendored"),
            Some(("pkg".to_string(), "@ https://host/pkg.zip#sha256=abc123".to_string()))
        );
        assert_eq!(parse_requirement("# just a comment"), None);
        assert_eq!(parse_requirement("   "), None);
        assert_eq!(parse_requirement("-r base.txt"), None);
    }

    #[test]
    fn test_probing_prefers_pyproject() {
        let dir = tempfile::TempDir::new().unwrap();
        fs::write(dir.path().join(REQUIREMENTS_FILE), "flask==3.0.0\n").unwrap();
        let workspace = Workspace::single(dir.path());

        assert_eq!(load_dependencies(&workspace).unwrap().as_str(), "flask: ==3.0.0");
        assert!(matches!(
            load_poetry_dependencies(&workspace).unwrap_err(),
            SnkrError::ManifestNotFound { .. }
        ));

        fs::write(
            dir.path().join(PYPROJECT_FILE),
            "[tool.poetry.dependencies]\npython = \"^3.12\"\n",
        )
        .unwrap();
        assert_eq!(load_dependencies(&workspace).unwrap().as_str(), "python: ^3.12");
    }

    #[test]
    fn test_only_first_root_is_consulted() {
        let first = tempfile::TempDir::new().unwrap();
        let second = tempfile::TempDir::new().unwrap();
        fs::write(second.path().join(REQUIREMENTS_FILE), "rich\n").unwrap();
        let workspace = Workspace::new(vec![first.path().to_path_buf(), second.path().to_path_buf()]);

        let err = load_dependencies(&workspace).unwrap_err();
        assert!(matches!(err, SnkrError::ManifestNotFound { ref path } if path.starts_with(first.path())));
    }

    #[test]
    fn test_no_workspace() {
        let err = load_dependencies(&Workspace::default()).unwrap_err();
        assert!(matches!(err, SnkrError::NoWorkspace));
    }
}
