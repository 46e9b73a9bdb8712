//! Schema and example config generation.
//!
//! This module provides functions to generate JSON schemas and example TOML
//! configurations from the config struct definitions.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use schemars::generate::SchemaSettings;
use schemars::Schema;
use serde_json::json;

use crate::config::AppConfig;

/// Generated schema filename.
pub const SCHEMA_FILENAME: &str = "config.schema.json";

/// Generated config filename.
pub const CONFIG_FILENAME: &str = "config.toml";

/// Generate the JSON schema for `AppConfig` using schemars.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn generate_schema(project_name: &str, repo_url: &str) -> Result<String> {
    // Use draft-07 for better TOML editor support
    let settings = SchemaSettings::draft07();
    let generator = settings.into_generator();
    let mut schema: Schema = generator.into_root_schema_for::<AppConfig>();

    // Set schema metadata using the Schema's insert method
    schema.insert(
        "$id".to_string(),
        json!(format!("{repo_url}/schemas/config.schema.json")),
    );
    schema.insert(
        "title".to_string(),
        json!(format!("{project_name} configuration")),
    );
    schema.insert(
        "description".to_string(),
        json!(format!("Configuration schema for {project_name}")),
    );

    // Add $schema property for LSP/editor support
    if let Some(props) = schema.get_mut("properties")
        && let Some(props_obj) = props.as_object_mut()
    {
        props_obj.insert(
            "$schema".to_string(),
            json!({
                "type": "string",
                "description": "JSON Schema reference for editor support"
            }),
        );
    }

    serde_json::to_string_pretty(&schema).context("serializing JSON schema")
}

/// Generate the example TOML configuration from the default `AppConfig`.
///
/// # Errors
///
/// Returns an error if TOML serialization fails.
pub fn generate_example_config(project_name: &str) -> Result<String> {
    let schema_url = format!(
        "https://raw.githubusercontent.com/byteowlz/schemas/refs/heads/main/{project_name}/{project_name}.config.schema.json"
    );

    // Serialize the default config to TOML
    let config = AppConfig::default();
    let toml_body =
        toml::to_string_pretty(&config).context("serializing default config to TOML")?;

    // Build output with schema reference and header
    let mut output = String::new();
    let _ = write!(
        output,
        r#""$schema" = "{schema_url}"

# Configuration for {project_name}.
# Copy this file to $XDG_CONFIG_HOME/{project_name}/config.toml and adjust as needed.

"#
    );
    output.push_str(&toml_body);

    Ok(output)
}

/// Write generated files to a directory.
///
/// # Errors
///
/// Returns an error if directory creation or file writing fails.
pub fn write_generated_files(output_dir: &Path, project_name: &str, repo_url: &str) -> Result<()> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("creating output directory: {}", output_dir.display()))?;

    let schema = generate_schema(project_name, repo_url)?;
    let schema_path = output_dir.join(SCHEMA_FILENAME);
    fs::write(&schema_path, &schema)
        .with_context(|| format!("writing schema to {}", schema_path.display()))?;

    let config = generate_example_config(project_name)?;
    let config_path = output_dir.join(CONFIG_FILENAME);
    fs::write(&config_path, &config)
        .with_context(|| format!("writing config to {}", config_path.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::APP_NAME;

    /// Repository URL for schema generation.
    const REPO_URL: &str = "https://github.com/byteowlz/emz";

    #[test]
    fn test_schema_generation() {
        let schema = generate_schema(APP_NAME, REPO_URL).expect("schema generation failed");
        assert!(schema.contains("\"title\""));
        assert!(schema.contains("emz configuration"));
        assert!(schema.contains("\"$schema\""));
        assert!(schema.contains("BatchPolicy"));
        assert!(schema.contains("all-or-nothing"));
    }

    #[test]
    fn test_config_generation() {
        let config = generate_example_config(APP_NAME).expect("config generation failed");
        assert!(config.contains("[logging]"));
        assert!(config.contains("[upload]"));
        assert!(config.contains("[endpoints]"));
        assert!(config.contains("$schema"));
    }

    #[test]
    fn generated_files_are_written() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_generated_files(dir.path(), APP_NAME, REPO_URL).expect("write files");

        let schema = fs::read_to_string(dir.path().join(SCHEMA_FILENAME)).expect("schema");
        let config = fs::read_to_string(dir.path().join(CONFIG_FILENAME)).expect("config");
        assert_eq!(schema, generate_schema(APP_NAME, REPO_URL).expect("schema"));
        assert!(config.starts_with("\"$schema\""));
    }
}
