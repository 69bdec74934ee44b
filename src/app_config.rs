//! Application configuration loading for CLI defaults.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use mirror_core::MirrorConfig;
use mirror_core::db::DatabaseOptions;

/// TOML-backed file configuration for mirror defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileConfig {
    /// Root for the database, library, cache and temp directories.
    pub data_dir: Option<PathBuf>,
    /// Default cache freshness window in seconds.
    pub cache_ttl_secs: Option<u64>,
    /// Execution ceiling per import batch in seconds (0 disables the guard).
    pub execution_ceiling_secs: Option<u64>,
    /// Safety margin before the ceiling in seconds.
    pub safety_margin_secs: Option<u64>,
    /// Descriptors per listing page.
    pub page_size: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
    /// Base of the byte-serving address scheme.
    pub proxy_base: Option<String>,
    /// Optional database pool max connections (1..=20).
    pub db_max_connections: Option<u32>,
    /// Optional database busy timeout in milliseconds.
    pub db_busy_timeout_ms: Option<u32>,
}

impl FileConfig {
    /// Validates config values against runtime constraints.
    pub fn validate(&self) -> Result<()> {
        if let Some(page_size) = self.page_size
            && !(1..=10_000).contains(&page_size)
        {
            bail!("Invalid config value for `page_size`: {page_size}. Expected range: 1..=10000");
        }
        if let Some(ttl) = self.cache_ttl_secs
            && ttl == 0
        {
            bail!("Invalid config value for `cache_ttl_secs`: 0. Expected a positive value");
        }
        if let (Some(ceiling), Some(margin)) =
            (self.execution_ceiling_secs, self.safety_margin_secs)
            && ceiling > 0
            && margin >= ceiling
        {
            bail!(
                "Invalid config value for `safety_margin_secs`: {margin}. Must be below `execution_ceiling_secs` ({ceiling})"
            );
        }
        validate_timeout_secs("connect_timeout_secs", self.connect_timeout_secs)?;
        validate_timeout_secs("read_timeout_secs", self.read_timeout_secs)?;
        validate_db_max_connections(self.db_max_connections)?;
        validate_db_busy_timeout_ms(self.db_busy_timeout_ms)?;
        Ok(())
    }

    /// Copies set values onto `config`.
    pub fn apply(&self, config: &mut MirrorConfig) {
        if let Some(secs) = self.cache_ttl_secs {
            config.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = self.execution_ceiling_secs {
            config.execution_ceiling = (secs > 0).then_some(Duration::from_secs(secs));
        }
        if let Some(secs) = self.safety_margin_secs {
            config.safety_margin = Duration::from_secs(secs);
        }
        if let Some(page_size) = self.page_size {
            config.page_size = usize::try_from(page_size).unwrap_or(usize::MAX);
        }
        if let Some(secs) = self.connect_timeout_secs {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.read_timeout_secs {
            config.read_timeout = Duration::from_secs(secs);
        }
        if let Some(base) = &self.proxy_base {
            config.proxy_base.clone_from(base);
        }
    }

    /// Pool options with file overrides.
    #[must_use]
    pub fn database_options(&self) -> DatabaseOptions {
        let mut options = DatabaseOptions::default();
        if let Some(max) = self.db_max_connections {
            options.max_connections = max;
        }
        if let Some(ms) = self.db_busy_timeout_ms {
            options.busy_timeout_ms = ms;
        }
        options
    }
}

fn validate_db_max_connections(value: Option<u32>) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(1..=20).contains(&value) {
        bail!("Invalid config value for `db_max_connections`: {value}. Expected range: 1..=20");
    }
    Ok(())
}

fn validate_db_busy_timeout_ms(value: Option<u32>) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if value > 120_000 {
        bail!("Invalid config value for `db_busy_timeout_ms`: {value}. Expected range: 0..=120000");
    }
    Ok(())
}

fn validate_timeout_secs(field: &str, value: Option<u64>) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(1..=3600).contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: 1..=3600");
    }
    Ok(())
}

/// Loaded config metadata.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Resolved config path if a base directory is known.
    pub path: Option<PathBuf>,
    /// Parsed file config when a config file exists and was valid.
    pub config: Option<FileConfig>,
}

/// Resolves default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/mirror/config.toml`
/// 2. `$HOME/.config/mirror/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config_home).join("mirror").join("config.toml"));
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("mirror")
            .join("config.toml"),
    )
}

/// Resolves the default data directory.
///
/// Priority:
/// 1. `$XDG_DATA_HOME/mirror`
/// 2. `$HOME/.local/share/mirror`
/// 3. `./.mirror`
#[must_use]
pub fn resolve_default_data_dir() -> PathBuf {
    if let Some(xdg_data_home) = env_var_non_empty_os("XDG_DATA_HOME") {
        return PathBuf::from(xdg_data_home).join("mirror");
    }
    match env_var_non_empty_os("HOME") {
        Some(home) => PathBuf::from(home).join(".local").join("share").join("mirror"),
        None => PathBuf::from(".mirror"),
    }
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads config from `explicit` or, when `None`, the default path if present.
pub fn load_file_config(explicit: Option<&Path>) -> Result<LoadedConfig> {
    let path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => resolve_default_config_path(),
    };
    let Some(path_ref) = path.as_deref() else {
        return Ok(LoadedConfig { path, config: None });
    };

    if !path_ref.exists() {
        if explicit.is_some() {
            bail!("Config file '{}' does not exist", path_ref.display());
        }
        return Ok(LoadedConfig { path, config: None });
    }

    let raw = fs::read_to_string(path_ref)
        .with_context(|| format!("Failed to read config file '{}'", path_ref.display()))?;
    let config = parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path_ref.display()))?;
    Ok(LoadedConfig {
        path,
        config: Some(config),
    })
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!(
                "Invalid config syntax on line {}: expected key = value",
                line_index + 1
            );
        };

        let key = raw_key.trim();
        let value = raw_value.trim();
        let line_no = line_index + 1;

        match key {
            "data_dir" => {
                let parsed = parse_string_literal(value)
                    .with_context(|| format!("Invalid `data_dir` value on line {line_no}"))?;
                cfg.data_dir = Some(PathBuf::from(parsed));
            }
            "proxy_base" => {
                let parsed = parse_string_literal(value)
                    .with_context(|| format!("Invalid `proxy_base` value on line {line_no}"))?;
                cfg.proxy_base = Some(parsed);
            }
            "cache_ttl_secs" => {
                cfg.cache_ttl_secs = Some(
                    parse_integer_u64(value)
                        .with_context(|| {
                            format!("Invalid `cache_ttl_secs` value on line {line_no}")
                        })?,
                );
            }
            "execution_ceiling_secs" => {
                cfg.execution_ceiling_secs = Some(parse_integer_u64(value).with_context(|| {
                    format!("Invalid `execution_ceiling_secs` value on line {line_no}")
                })?);
            }
            "safety_margin_secs" => {
                cfg.safety_margin_secs = Some(parse_integer_u64(value).with_context(|| {
                    format!("Invalid `safety_margin_secs` value on line {line_no}")
                })?);
            }
            "page_size" => {
                cfg.page_size = Some(
                    parse_integer_u64(value)
                        .with_context(|| format!("Invalid `page_size` value on line {line_no}"))?,
                );
            }
            "connect_timeout_secs" => {
                cfg.connect_timeout_secs = Some(parse_integer_u64(value).with_context(|| {
                    format!("Invalid `connect_timeout_secs` value on line {line_no}")
                })?);
            }
            "read_timeout_secs" => {
                cfg.read_timeout_secs = Some(parse_integer_u64(value).with_context(|| {
                    format!("Invalid `read_timeout_secs` value on line {line_no}")
                })?);
            }
            "db_max_connections" => {
                let parsed = parse_integer_u64(value).with_context(|| {
                    format!("Invalid `db_max_connections` value on line {line_no}")
                })?;
                let n = u32::try_from(parsed)
                    .map_err(|_| anyhow::anyhow!("db_max_connections out of range for u32"))?;
                cfg.db_max_connections = Some(n);
            }
            "db_busy_timeout_ms" => {
                let parsed = parse_integer_u64(value).with_context(|| {
                    format!("Invalid `db_busy_timeout_ms` value on line {line_no}")
                })?;
                let n = u32::try_from(parsed)
                    .map_err(|_| anyhow::anyhow!("db_busy_timeout_ms out of range for u32"))?;
                cfg.db_busy_timeout_ms = Some(n);
            }
            unknown => {
                bail!("Unknown configuration key: '{unknown}' on line {line_no}");
            }
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_integer_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))
}
