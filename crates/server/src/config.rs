use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use pipeline::RetryPolicy;
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub server_public_url: Option<String>,
    pub session_secret: String,
    pub session_issuer: String,
    pub session_ttl_seconds: i64,
    pub max_logo_bytes: usize,
    pub trigger_max_attempts: u32,
    pub trigger_backoff_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/tracker.db".into(),
            server_public_url: None,
            session_secret: "devsecret".into(),
            session_issuer: "job-tracker".into(),
            session_ttl_seconds: 7 * 24 * 3600,
            max_logo_bytes: 2 * 1024 * 1024,
            trigger_max_attempts: 5,
            trigger_backoff_ms: 200,
        }
    }
}

impl Settings {
    /// Base URL logo links are built from.
    pub fn public_url(&self) -> String {
        self.server_public_url
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.server_bind))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.trigger_max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.trigger_backoff_ms),
            ..RetryPolicy::default()
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();
    if let Ok(raw) = fs::read_to_string("server.toml") {
        apply_file(&mut settings, &raw);
    }
    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings
}

/// Flat `key = value` table; unknown keys are ignored.
fn apply_file(settings: &mut Settings, raw: &str) {
    let file_cfg = match toml::from_str::<HashMap<String, toml::Value>>(raw) {
        Ok(cfg) => cfg,
        Err(error) => {
            warn!(%error, "ignoring unreadable server.toml");
            return;
        }
    };
    let get = |key: &str| {
        file_cfg.get(key).map(|value| match value {
            toml::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    };

    if let Some(v) = get("bind_addr") {
        settings.server_bind = v;
    }
    if let Some(v) = get("database_url") {
        settings.database_url = v;
    }
    if let Some(v) = get("server_public_url") {
        settings.server_public_url = Some(v);
    }
    if let Some(v) = get("session_secret") {
        settings.session_secret = v;
    }
    if let Some(v) = get("session_issuer") {
        settings.session_issuer = v;
    }
    set_parsed(&mut settings.session_ttl_seconds, "session_ttl_seconds", get("session_ttl_seconds"));
    set_parsed(&mut settings.max_logo_bytes, "max_logo_bytes", get("max_logo_bytes"));
    set_parsed(&mut settings.trigger_max_attempts, "trigger_max_attempts", get("trigger_max_attempts"));
    set_parsed(&mut settings.trigger_backoff_ms, "trigger_backoff_ms", get("trigger_backoff_ms"));
}

/// Later keys win, so `APP__*` overrides the bare names.
fn apply_env(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    for key in ["SERVER_BIND", "APP__BIND_ADDR"] {
        if let Some(v) = lookup(key) {
            settings.server_bind = v;
        }
    }
    for key in ["DATABASE_URL", "APP__DATABASE_URL"] {
        if let Some(v) = lookup(key) {
            settings.database_url = v;
        }
    }
    for key in ["SERVER_PUBLIC_URL", "APP__SERVER_PUBLIC_URL"] {
        if let Some(v) = lookup(key) {
            settings.server_public_url = Some(v);
        }
    }
    if let Some(v) = lookup("APP__SESSION_SECRET") {
        settings.session_secret = v;
    }
    set_parsed(
        &mut settings.session_ttl_seconds,
        "APP__SESSION_TTL_SECONDS",
        lookup("APP__SESSION_TTL_SECONDS"),
    );
    set_parsed(
        &mut settings.max_logo_bytes,
        "APP__MAX_LOGO_BYTES",
        lookup("APP__MAX_LOGO_BYTES"),
    );
    set_parsed(
        &mut settings.trigger_max_attempts,
        "APP__TRIGGER_MAX_ATTEMPTS",
        lookup("APP__TRIGGER_MAX_ATTEMPTS"),
    );
    set_parsed(
        &mut settings.trigger_backoff_ms,
        "APP__TRIGGER_BACKOFF_MS",
        lookup("APP__TRIGGER_BACKOFF_MS"),
    );
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, key: &str, raw: Option<String>) {
    let Some(raw) = raw else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key, value = %raw, "ignoring unparsable setting"),
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }
    if raw_database_url.starts_with("sqlite::memory:") {
        return raw_database_url.to_string();
    }
    if let Some(path) = raw_database_url.strip_prefix("sqlite://") {
        if has_drive_letter(path) {
            return format!("sqlite:{path}");
        }
        return raw_database_url.to_string();
    }
    if raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    let path = raw_database_url
        .strip_prefix("sqlite:")
        .unwrap_or(raw_database_url)
        .replace('\\', "/");
    if has_drive_letter(&path) {
        format!("sqlite:{path}")
    } else {
        format!("sqlite://{path}")
    }
}

fn has_drive_letter(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
