//! Imposter definitions loaded at startup.

use crate::imposter::ImposterConfig;
use serde::Deserialize;
use std::path::Path;

/// `{"imposters": [...]}` or a bare list of imposter declarations.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ImpostersFile {
    Wrapped { imposters: Vec<ImposterConfig> },
    List(Vec<ImposterConfig>),
}

impl ImpostersFile {
    pub fn into_imposters(self) -> Vec<ImposterConfig> {
        match self {
            ImpostersFile::Wrapped { imposters } | ImpostersFile::List(imposters) => imposters,
        }
    }
}

pub fn load_imposters<P: AsRef<Path>>(path: P) -> Result<Vec<ImposterConfig>, anyhow::Error> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let file: ImpostersFile = serde_yaml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse imposters in {}: {e}", path.display()))?;
    Ok(file.into_imposters())
}
