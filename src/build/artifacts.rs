//! Build artifacts.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::locator::join_url;
use crate::lock;

/// A file archived by a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub display_path: String,
    pub file_name: String,
    /// Path below the build's artifact root. Identifies the artifact.
    pub relative_path: String,
    /// Download URL.
    pub url: String,
}

impl Artifact {
    fn from_json(build_url: &str, value: &Value) -> Option<Self> {
        let relative_path = value.get("relativePath")?.as_str()?.to_string();
        let text = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);
        let file_name = text("fileName").unwrap_or_else(|| {
            relative_path
                .rsplit('/')
                .next()
                .unwrap_or(&relative_path)
                .to_string()
        });
        Some(Self {
            display_path: text("displayPath").unwrap_or_else(|| file_name.clone()),
            url: join_url(&[build_url, "artifact", &relative_path]),
            file_name,
            relative_path,
        })
    }
}

/// Artifacts of one build, keyed by relative path.
#[derive(Debug)]
pub struct ArtifactSet {
    build_url: String,
    entries: Mutex<BTreeMap<String, Artifact>>,
}

impl ArtifactSet {
    pub fn new(build_url: impl Into<String>) -> Self {
        Self {
            build_url: build_url.into(),
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Applies a fresh listing: known artifacts are kept as they are, new ones
    /// added, missing ones dropped.
    pub(crate) fn update(&self, listing: &[Value]) {
        let mut entries = lock(&self.entries);
        let mut listed = BTreeSet::new();
        for artifact in listing.iter().filter_map(|v| Artifact::from_json(&self.build_url, v)) {
            listed.insert(artifact.relative_path.clone());
            entries
                .entry(artifact.relative_path.clone())
                .or_insert(artifact);
        }
        entries.retain(|path, _| listed.contains(path));
    }

    /// Copy of the current artifacts, ordered by relative path.
    pub fn snapshot(&self) -> Vec<Artifact> {
        lock(&self.entries).values().cloned().collect()
    }

    pub fn get(&self, relative_path: &str) -> Option<Artifact> {
        lock(&self.entries).get(relative_path).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolves the destination of `relative` below `base`.
///
/// Rejects absolute paths, parent components and empty paths.
pub fn destination(base: &Path, relative: &Path) -> Result<PathBuf> {
    let mut target = base.to_path_buf();
    let mut depth = 0;
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                target.push(part);
                depth += 1;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::InvalidArtifactPath(relative.display().to_string()));
            }
        }
    }
    if depth == 0 {
        return Err(Error::InvalidArtifactPath(relative.display().to_string()));
    }
    Ok(target)
}
