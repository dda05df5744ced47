//! Project fixtures written into a sandbox.

use std::fmt;
use std::path::Path;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// An ordered set of files describing a buildable project.
///
/// Files are written in the order they were added, so a later entry for the
/// same path overwrites an earlier one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fixture {
    /// Fixture name, used in log output.
    #[serde(default)]
    pub name: String,

    /// Relative path -> file content, in write order.
    #[serde(default, with = "ordered_files")]
    files: Vec<(String, String)>,
}

impl Fixture {
    /// Creates an empty fixture.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            files: Vec::new(),
        }
    }

    /// Adds a file.
    pub fn file(mut self, path: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.push((path.into(), content.into()));
        self
    }

    /// Adds a pretty-printed JSON file, typically a `package.json`.
    pub fn json(self, path: impl Into<String>, value: &serde_json::Value) -> Result<Self> {
        let path = path.into();
        let content = serde_json::to_string_pretty(value)
            .map_err(|e| Error::Config(format!("failed to serialize {}: {}", path, e)))?;
        Ok(self.file(path, content + "\n"))
    }

    /// Returns the files in write order.
    pub fn files(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().map(|(p, c)| (p.as_str(), c.as_str()))
    }

    /// Number of file entries.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns true if the fixture has no files.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Loads a fixture from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;

        let mut fixture = Self::from_yaml(&content)?;
        if fixture.name.is_empty() {
            if let Some(stem) = path.file_stem() {
                fixture.name = stem.to_string_lossy().into_owned();
            }
        }
        Ok(fixture)
    }

    /// Parses a fixture from YAML text.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("failed to parse fixture: {}", e)))
    }
}

/// Flattens fixtures into one write sequence.
///
/// Fixture order is kept, and file order within each fixture.
pub fn flatten<'a>(fixtures: impl IntoIterator<Item = &'a Fixture>) -> Vec<(&'a str, &'a str)> {
    fixtures.into_iter().flat_map(|f| f.files()).collect()
}

/// Serializes the file list as a YAML/JSON mapping without losing order.
mod ordered_files {
    use super::*;

    pub fn serialize<S: Serializer>(
        files: &[(String, String)],
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_map(files.iter().map(|(p, c)| (p, c)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Vec<(String, String)>, D::Error> {
        deserializer.deserialize_map(OrderedFilesVisitor)
    }

    struct OrderedFilesVisitor;

    impl<'de> Visitor<'de> for OrderedFilesVisitor {
        type Value = Vec<(String, String)>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a mapping of relative paths to file contents")
        }

        fn visit_map<A: MapAccess<'de>>(
            self,
            mut map: A,
        ) -> std::result::Result<Self::Value, A::Error> {
            let mut files = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some(entry) = map.next_entry::<String, String>()? {
                files.push(entry);
            }
            Ok(files)
        }
    }
}
