use std::fs;
use std::path::Path;

use anyhow::{Context as AnyhowContext, Result};

use crate::dsl::SpecificationDef;

pub fn load_specification_from_yaml(file_path: impl AsRef<Path>) -> Result<SpecificationDef> {
    let file_path = file_path.as_ref();
    let yaml_content = fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read YAML file from {}", file_path.display()))?;

    parse_specification(&yaml_content)
        .with_context(|| format!("Failed to deserialize YAML content from {}", file_path.display()))
}

pub fn parse_specification(yaml: &str) -> Result<SpecificationDef> {
    let spec: SpecificationDef = serde_yaml::from_str(yaml)?;
    Ok(spec)
}
