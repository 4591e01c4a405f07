use std::{collections::HashMap, fs, path::Path};

use anyhow::{anyhow, bail, Context};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use protocol_client::{Env, LogLevel, DB_ENCRYPTION_KEY_LEN};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub env: Env,
    pub logging_level: Option<LogLevel>,
    /// Base64, 32 bytes once decoded.
    pub db_encryption_key: Option<String>,
    pub inbox_seed: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            env: Env::Dev,
            logging_level: None,
            db_encryption_key: None,
            inbox_seed: "0xa11ce".into(),
        }
    }
}

/// Defaults, then `path` if it exists, then the process environment.
pub fn load_settings(path: &Path) -> anyhow::Result<Settings> {
    load_settings_with(path, |key| std::env::var(key).ok())
}

fn load_settings_with(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        let file_cfg = toml::from_str::<HashMap<String, String>>(&raw)
            .with_context(|| format!("failed to parse settings file '{}'", path.display()))?;
        if let Some(v) = file_cfg.get("env") {
            settings.env = parse_env(v)?;
        }
        if let Some(v) = file_cfg.get("logging_level") {
            settings.logging_level = Some(parse_log_level(v)?);
        }
        if let Some(v) = file_cfg.get("db_encryption_key") {
            settings.db_encryption_key = Some(v.clone());
        }
        if let Some(v) = file_cfg.get("inbox_seed") {
            settings.inbox_seed = v.clone();
        }
    }

    if let Some(v) = env("SYNC_ENV") {
        settings.env = parse_env(&v)?;
    }
    if let Some(v) = env("APP__ENV") {
        settings.env = parse_env(&v)?;
    }

    if let Some(v) = env("APP__LOGGING_LEVEL") {
        settings.logging_level = Some(parse_log_level(&v)?);
    }

    if let Some(v) = env("APP__DB_ENCRYPTION_KEY") {
        settings.db_encryption_key = Some(v);
    }

    Ok(settings)
}

pub fn parse_env(raw: &str) -> anyhow::Result<Env> {
    raw.parse::<Env>().map_err(|err| anyhow!(err))
}

pub fn parse_log_level(raw: &str) -> anyhow::Result<LogLevel> {
    raw.parse::<LogLevel>().map_err(|err| anyhow!(err))
}

pub fn decode_db_key(raw: &str) -> anyhow::Result<[u8; DB_ENCRYPTION_KEY_LEN]> {
    let bytes = STANDARD
        .decode(raw.trim())
        .context("db encryption key is not valid base64")?;
    let len = bytes.len();
    match <[u8; DB_ENCRYPTION_KEY_LEN]>::try_from(bytes) {
        Ok(key) => Ok(key),
        Err(_) => bail!("db encryption key must be {DB_ENCRYPTION_KEY_LEN} bytes, got {len}"),
    }
}
