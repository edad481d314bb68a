//! The declarative-catalog loader. Parses a YAML file into the engine's
//! in-memory `Catalog`; the engine itself never touches the filesystem. An
//! older INI-based catalog format is treated as producing an equivalent
//! catalog via an external adapter whose shape we don't attempt to guess.

use std::path::Path;

use anyhow::{Context, Result};
use scheduler_core::catalog::{Job, ResourceGroupSpec};
use scheduler_core::Catalog;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    resource_groups: Vec<ResourceGroupSpec>,
    #[serde(default)]
    jobs: Vec<Job>,
}

/// Parse `contents` (a YAML document) into a validated `Catalog`.
pub fn parse(contents: &str) -> Result<Catalog> {
    let file: CatalogFile = serde_yaml::from_str(contents).context("failed to parse catalog YAML")?;
    Catalog::new(file.jobs, file.resource_groups).context("catalog failed validation")
}

/// Load and validate the catalog at `path`.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Catalog> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read catalog file {}", path.display()))?;
    parse(&contents)
}
