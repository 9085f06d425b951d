//! Versioned persistence for unified schemas.
//!
//! Each published schema lands as one YAML document named
//! `<name>.v<version>.yaml` under the registry directory. Consumers always
//! load an explicit `(name, version)` pair; there is no implicit "latest"
//! for migration or validation, which keeps a running batch pinned to the
//! schema it started with.

use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use log::info;

use crate::{
    consolidate::UnifiedSchema,
    error::{PipelineError, Result},
};

pub struct SchemaRegistry {
    root: PathBuf,
}

impl SchemaRegistry {
    /// Opens (creating if needed) a registry directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|err| PipelineError::io(&root, err))?;
        Ok(SchemaRegistry { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn schema_path(&self, name: &str, version: u32) -> PathBuf {
        self.root.join(format!("{name}.v{version:04}.yaml"))
    }

    /// Publishes a schema, assigning its version.
    ///
    /// A structural change over the latest stored version yields version + 1
    /// and a new document. Republishing an unchanged structure is a no-op
    /// that returns the already-assigned version.
    pub fn publish(&self, schema: &mut UnifiedSchema) -> Result<u32> {
        if schema.is_empty() {
            return Err(PipelineError::EmptySchema {
                name: schema.name.clone(),
            });
        }
        let versions = self.versions(&schema.name)?;
        if let Some(latest) = versions.last() {
            let stored = self.load(&schema.name, *latest)?;
            if stored.structural_signature() == schema.structural_signature() {
                schema.version = *latest;
                return Ok(*latest);
            }
            schema.version = latest + 1;
        } else {
            schema.version = 1;
        }

        let path = self.schema_path(&schema.name, schema.version);
        let file = File::create(&path).map_err(|err| PipelineError::io(&path, err))?;
        serde_yaml::to_writer(file, schema)?;
        info!(
            "Published schema '{}' version {} ({} column(s)) to {:?}",
            schema.name,
            schema.version,
            schema.column_count(),
            path
        );
        Ok(schema.version)
    }

    /// Loads an explicit schema version.
    pub fn load(&self, name: &str, version: u32) -> Result<UnifiedSchema> {
        let path = self.schema_path(name, version);
        let file = File::open(&path).map_err(|_| PipelineError::UnknownSchemaVersion {
            name: name.to_string(),
            version,
        })?;
        let schema: UnifiedSchema = serde_yaml::from_reader(BufReader::new(file))?;
        Ok(schema)
    }

    /// All stored versions of a schema name, ascending.
    pub fn versions(&self, name: &str) -> Result<Vec<u32>> {
        let mut versions = Vec::new();
        let entries =
            std::fs::read_dir(&self.root).map_err(|err| PipelineError::io(&self.root, err))?;
        let prefix = format!("{name}.v");
        for entry in entries {
            let entry = entry.map_err(|err| PipelineError::io(&self.root, err))?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(stem) = file_name.strip_suffix(".yaml")
                && let Some(version) = stem.strip_prefix(&prefix)
                && let Ok(version) = version.parse::<u32>()
            {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    pub fn latest_version(&self, name: &str) -> Result<Option<u32>> {
        Ok(self.versions(name)?.last().copied())
    }
}
