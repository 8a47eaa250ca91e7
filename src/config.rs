//! Deployment capacities.
//!
//! Edge devices reserve their memory up front; the hub makes the same
//! promise through two configured ceilings. Exhausting one surfaces as
//! `NoMemory` from whatever operation needed the allocation, with the tree
//! rolled back.

use std::{fs, io, path::Path};

use anyhow::{Context, Result};
use serde_derive::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct Configuration {
    /// Most entries the tree will hold (zombies included). Absent means
    /// unlimited.
    #[serde(default)]
    pub max_entries: Option<usize>,
    /// Most live resources (placeholders included). Absent means unlimited.
    #[serde(default)]
    pub max_resources: Option<usize>,
}

/// Load capacities from a TOML file; a missing file means defaults.
pub fn load(path: &Path) -> Result<Configuration> {
    let s = match fs::read_to_string(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Configuration::default()),
        found => found,
    }
    .with_context(|| format!("Couldn't open {}", path.display()))?;
    let conf = toml::from_str(&s).with_context(|| format!("Couldn't parse {}", path.display()))?;
    Ok(conf)
}
