//! The migration catalog: declared groups flattened into one ordered list.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::{GroupConfig, StrataConfig};
use crate::error::{Result, StrataError};

/// One migration file, identified by its filename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationFile {
    pub filename: String,
    pub group: String,
    /// Where the content is read from. Usually `{group directory}/{filename}`,
    /// unless a redirect points elsewhere.
    pub source_path: PathBuf,
}

impl MigrationFile {
    pub fn exists(&self) -> bool {
        self.source_path.is_file()
    }

    pub fn read(&self) -> Result<String> {
        Ok(std::fs::read_to_string(&self.source_path)?)
    }

    /// Names of the `.sql` files sitting next to where this file was expected.
    pub fn available_siblings(&self) -> Vec<String> {
        let Some(dir) = self.source_path.parent() else {
            return Vec::new();
        };
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .filter(|name| name.ends_with(".sql"))
            .collect();
        names.sort();
        names
    }
}

/// The flattened, ordered migration list.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    files: Vec<MigrationFile>,
}

impl Catalog {
    /// Flatten `groups` in declared order.
    ///
    /// Relative directories and redirect targets resolve against `base_dir`.
    /// A filename declared twice anywhere is a `DuplicateFilename` error.
    pub fn build(
        groups: &[GroupConfig],
        redirects: &BTreeMap<String, PathBuf>,
        base_dir: &Path,
    ) -> Result<Self> {
        let resolve = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                base_dir.join(p)
            }
        };

        let mut seen: HashMap<&str, &str> = HashMap::new();
        let mut files = Vec::new();

        for group in groups {
            let directory = resolve(&group.directory);
            for filename in &group.files {
                if let Some(first_group) = seen.insert(filename, &group.name) {
                    return Err(StrataError::DuplicateFilename {
                        filename: filename.clone(),
                        first_group: first_group.to_string(),
                        second_group: group.name.clone(),
                    });
                }

                let source_path = match redirects.get(filename) {
                    Some(target) => resolve(target),
                    None => directory.join(filename),
                };

                files.push(MigrationFile {
                    filename: filename.clone(),
                    group: group.name.clone(),
                    source_path,
                });
            }
        }

        for name in redirects.keys() {
            if !seen.contains_key(name.as_str()) {
                tracing::warn!(filename = %name, "Redirect names a file that no group declares");
            }
        }

        Ok(Self { files })
    }

    pub fn from_config(config: &StrataConfig) -> Result<Self> {
        Self::build(
            &config.migrations.groups,
            &config.migrations.redirects,
            &config.base_dir,
        )
    }

    pub fn files(&self) -> &[MigrationFile] {
        &self.files
    }

    pub fn get(&self, filename: &str) -> Option<&MigrationFile> {
        self.files.iter().find(|f| f.filename == filename)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
