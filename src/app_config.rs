//! Configuration file loading for CLI defaults.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use fulfillment_core::config::EngineConfig;

/// File configuration for fulfillment defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileConfig {
    /// Base directory for account content.
    pub content_dir: Option<PathBuf>,
    /// Account whose content directory is used.
    pub account: Option<String>,
    /// HTTP connect timeout in seconds.
    pub connect_timeout_secs: Option<u64>,
    /// HTTP read timeout in seconds.
    pub read_timeout_secs: Option<u64>,
    /// Concurrent transfer limit.
    pub max_concurrent_downloads: Option<u64>,
    /// Redirects followed per task.
    pub max_redirects: Option<u64>,
    /// Debounce window for progress notifications in milliseconds.
    pub progress_debounce_ms: Option<u64>,
    /// Treat `application/json` responses as Overdrive manifests.
    pub overdrive_manifests: Option<bool>,
}

impl FileConfig {
    /// Validates config values against engine constraints.
    pub fn validate(&self) -> Result<()> {
        validate_range("connect_timeout_secs", self.connect_timeout_secs, 1, 600)?;
        validate_range("read_timeout_secs", self.read_timeout_secs, 1, 86_400)?;
        validate_range(
            "max_concurrent_downloads",
            self.max_concurrent_downloads,
            1,
            64,
        )?;
        validate_range("max_redirects", self.max_redirects, 1, 50)?;
        validate_range("progress_debounce_ms", self.progress_debounce_ms, 0, 10_000)?;
        if let Some(account) = &self.account
            && account.trim().is_empty()
        {
            bail!("Invalid config value for `account`: must not be empty");
        }
        Ok(())
    }

    /// Applies file values on top of `config`.
    pub fn apply_to(&self, config: &mut EngineConfig) -> Result<()> {
        if let Some(dir) = &self.content_dir {
            config.content_base_dir.clone_from(dir);
        }
        if let Some(account) = &self.account {
            config.account_id.clone_from(account);
        }
        if let Some(secs) = self.connect_timeout_secs {
            config.connect_timeout_secs = secs;
        }
        if let Some(secs) = self.read_timeout_secs {
            config.read_timeout_secs = secs;
        }
        if let Some(max) = self.max_concurrent_downloads {
            config.max_concurrent_downloads = usize::try_from(max)
                .context("max_concurrent_downloads out of range for usize")?;
        }
        if let Some(max) = self.max_redirects {
            config.max_redirects =
                u32::try_from(max).context("max_redirects out of range for u32")?;
        }
        if let Some(ms) = self.progress_debounce_ms {
            config.progress_debounce = Duration::from_millis(ms);
        }
        if let Some(enabled) = self.overdrive_manifests {
            config.overdrive_manifests = enabled;
        }
        Ok(())
    }
}

fn validate_range(field: &str, value: Option<u64>, min: u64, max: u64) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(min..=max).contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: {min}..={max}");
    }
    Ok(())
}

/// Resolves default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/fulfillment/config.toml`
/// 2. `$HOME/.config/fulfillment/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("fulfillment")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("fulfillment")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads config from the default path; missing files yield defaults.
pub fn load_default_file_config() -> Result<FileConfig> {
    match resolve_default_config_path() {
        Some(path) if path.exists() => load_file_config(&path),
        _ => Ok(FileConfig::default()),
    }
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let line_number = line_index + 1;

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!("Invalid config syntax on line {line_number}: expected key = value");
        };

        let key = raw_key.trim();
        let value = raw_value.trim();
        let context = || format!("Invalid `{key}` value on line {line_number}");

        match key {
            "content_dir" => {
                cfg.content_dir = Some(PathBuf::from(
                    parse_string_literal(value).with_context(context)?,
                ));
            }
            "account" => {
                cfg.account = Some(parse_string_literal(value).with_context(context)?);
            }
            "connect_timeout_secs" => {
                cfg.connect_timeout_secs = Some(parse_integer_u64(value).with_context(context)?);
            }
            "read_timeout_secs" => {
                cfg.read_timeout_secs = Some(parse_integer_u64(value).with_context(context)?);
            }
            "max_concurrent_downloads" => {
                cfg.max_concurrent_downloads =
                    Some(parse_integer_u64(value).with_context(context)?);
            }
            "max_redirects" => {
                cfg.max_redirects = Some(parse_integer_u64(value).with_context(context)?);
            }
            "progress_debounce_ms" => {
                cfg.progress_debounce_ms = Some(parse_integer_u64(value).with_context(context)?);
            }
            "overdrive_manifests" => {
                cfg.overdrive_manifests = Some(parse_boolean(value).with_context(context)?);
            }
            unknown => {
                bail!("Unknown configuration key: '{unknown}' on line {line_number}");
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

fn parse_boolean(raw_value: &str) -> Result<bool> {
    match raw_value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => bail!("Expected 'true' or 'false'"),
    }
}
