//! Multi-format configuration loading.
//!
//! Formats are picked from the file extension. `${VAR}` and `$VAR`
//! references are replaced from the process environment before parsing;
//! unknown variables are left as written.

use super::EngineConfig;
use crate::error::{KernelError, KernelResult};
use config::{Config as Cfg, Environment, File};
use error_stack::ResultExt;
use regex::Regex;
use serde::de::DeserializeOwned;
use std::path::Path;

pub use config::FileFormat;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

const ENV_REFERENCE: &str = r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)\b";

/// Detect the configuration format from a file extension.
///
/// `.yaml`/`.yml`, `.toml`, `.json`, `.ini`, `.ron` and `.json5` are
/// recognised.
pub fn detect_format(path: &str) -> ConfigResult<FileFormat> {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("No file extension found".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        "ini" => Ok(FileFormat::Ini),
        "ron" => Ok(FileFormat::Ron),
        "json5" => Ok(FileFormat::Json5),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

/// Replace `${VAR}` and `$VAR` references with environment values.
///
/// Substitution is a single pass, so a value containing `$OTHER` is not
/// expanded again.
pub fn substitute_env_vars(content: &str) -> ConfigResult<String> {
    let pattern = Regex::new(ENV_REFERENCE).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let result = pattern.replace_all(content, |caps: &regex::Captures| {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        std::env::var(name).unwrap_or_else(|_| caps[0].to_string())
    });
    Ok(result.into_owned())
}

fn deserialize<T: DeserializeOwned>(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
) -> ConfigResult<T> {
    let config = builder
        .build()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;
    config
        .try_deserialize()
        .map_err(|e| ConfigError::Serialization(e.to_string()))
}

fn file_source(path: &str) -> ConfigResult<File<config::FileSourceString, FileFormat>> {
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    let substituted = substitute_env_vars(&content)?;
    Ok(File::from_str(&substituted, format))
}

/// Load a configuration file, detecting its format from the extension.
pub fn load_config<T: DeserializeOwned>(path: &str) -> ConfigResult<T> {
    deserialize(Cfg::builder().add_source(file_source(path)?))
}

/// Parse configuration text in an explicit format.
pub fn from_str<T: DeserializeOwned>(content: &str, format: FileFormat) -> ConfigResult<T> {
    let substituted = substitute_env_vars(content)?;
    deserialize(Cfg::builder().add_source(File::from_str(&substituted, format)))
}

/// Layer several configuration texts; later sources override earlier ones.
pub fn merge_configs<T: DeserializeOwned>(sources: &[(&str, FileFormat)]) -> ConfigResult<T> {
    let mut builder = Cfg::builder();
    for (content, format) in sources {
        let substituted = substitute_env_vars(content)?;
        builder = builder.add_source(File::from_str(&substituted, *format));
    }
    deserialize(builder)
}

/// Layer several configuration files; later files override earlier ones.
pub fn load_merged<T: DeserializeOwned>(paths: &[&str]) -> ConfigResult<T> {
    let mut builder = Cfg::builder();
    for path in paths {
        builder = builder.add_source(file_source(path)?);
    }
    deserialize(builder)
}

/// Load a file and apply `PREFIX_SECTION__FIELD` environment overrides.
pub fn load_with_env<T: DeserializeOwned>(path: &str, env_prefix: &str) -> ConfigResult<T> {
    deserialize(
        Cfg::builder().add_source(file_source(path)?).add_source(
            Environment::with_prefix(env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        ),
    )
}

/// Load and validate an [`EngineConfig`].
pub fn load_engine_config(path: &str) -> KernelResult<EngineConfig> {
    let config: EngineConfig = load_config(path)
        .map_err(KernelError::from)
        .attach(format!("loading engine config from {path}"))?;
    config
        .validate()
        .map_err(KernelError::from)
        .attach(format!("validating engine config from {path}"))?;
    tracing::debug!(path, "loaded engine config");
    Ok(config)
}
