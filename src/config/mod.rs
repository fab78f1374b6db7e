use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

/// Runtime configuration, assembled entirely from environment variables per
/// the coordinator's §6.4 contract. There is no config file: the teacher's
/// TOML-file-then-env-override shape doesn't apply here because nothing in
/// scope needs a persisted, human-edited config.
#[derive(Debug, Clone)]
pub struct Config {
    pub workspace_dir: PathBuf,
    pub database_path: PathBuf,
    pub runner: RunnerKind,
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Default)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
    pub allowed_user_ids: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerKind {
    Pi,
    Echo,
}

impl Config {
    pub fn load() -> Result<Self> {
        if let Err(e) = dotenv::dotenv() {
            if !e.not_found() {
                warn!("failed to load .env file: {}", e);
            }
        }

        let workspace_dir = resolve_workspace_dir()?;
        std::fs::create_dir_all(&workspace_dir)
            .with_context(|| format!("failed to create workspace dir {}", workspace_dir.display()))?;
        set_dir_permissions_0700(&workspace_dir)?;

        let database_path = resolve_database_path(&workspace_dir)?;

        let runner = match std::env::var("RUNNER").ok().as_deref() {
            None | Some("") => RunnerKind::Pi,
            Some("pi") => RunnerKind::Pi,
            Some("echo") => RunnerKind::Echo,
            Some(other) => bail!("invalid RUNNER value {:?}, expected pi or echo", other),
        };

        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = match std::env::var("PORT") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("invalid PORT value {:?}", raw))?,
            Err(_) => 31415,
        };

        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        validate_log_level(&log_level)?;

        let telegram = load_telegram_config()?;

        info!(
            workspace = %workspace_dir.display(),
            database = %database_path.display(),
            runner = ?runner,
            "configuration loaded"
        );

        Ok(Self {
            workspace_dir,
            database_path,
            runner,
            host,
            port,
            log_level,
            telegram,
        })
    }
}

fn expand_tilde(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    } else if raw == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(raw)
}

fn resolve_workspace_dir() -> Result<PathBuf> {
    Ok(match std::env::var("WORKSPACE_DIR") {
        Ok(raw) if !raw.is_empty() => expand_tilde(&raw),
        _ => {
            let home = dirs::home_dir().context("could not determine home directory")?;
            home.join(".jagc")
        }
    })
}

fn resolve_database_path(workspace_dir: &Path) -> Result<PathBuf> {
    Ok(match std::env::var("DATABASE_PATH") {
        Ok(raw) if !raw.is_empty() => {
            let expanded = expand_tilde(&raw);
            if expanded.is_absolute() {
                expanded
            } else {
                workspace_dir.join(expanded)
            }
        }
        _ => workspace_dir.join("jagc.sqlite"),
    })
}

fn validate_log_level(level: &str) -> Result<()> {
    const LEVELS: &[&str] = &[
        "fatal", "error", "warn", "info", "debug", "trace", "silent",
    ];
    if LEVELS.contains(&level) {
        Ok(())
    } else {
        bail!(
            "invalid LOG_LEVEL {:?}, expected one of {:?}",
            level,
            LEVELS
        )
    }
}

/// Parses `TELEGRAM_ALLOWED_USER_IDS`, normalizing leading zeros and
/// duplicates via integer parsing (`"00101,101"` -> `[101]`). Any
/// non-decimal entry is a startup error, matching §6.4 and testable
/// property #8.
fn load_telegram_config() -> Result<TelegramConfig> {
    let bot_token = std::env::var("TELEGRAM_BOT_TOKEN")
        .ok()
        .filter(|s| !s.is_empty());

    let mut allowed_user_ids = Vec::new();
    if let Ok(raw) = std::env::var("TELEGRAM_ALLOWED_USER_IDS") {
        if !raw.is_empty() {
            for entry in raw.split(',') {
                let trimmed = entry.trim();
                let id: i64 = trimmed
                    .parse()
                    .with_context(|| format!("invalid TELEGRAM_ALLOWED_USER_IDS entry {:?}", trimmed))?;
                if !allowed_user_ids.contains(&id) {
                    allowed_user_ids.push(id);
                }
            }
        }
    }

    Ok(TelegramConfig {
        bot_token,
        allowed_user_ids,
    })
}

#[cfg(unix)]
fn set_dir_permissions_0700(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o700);
    std::fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_dir_permissions_0700(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_tilde_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde("~/foo"), home.join("foo"));
        }
    }

    #[test]
    fn validate_log_level_accepts_known() {
        assert!(validate_log_level("debug").is_ok());
        assert!(validate_log_level("silent").is_ok());
    }

    #[test]
    fn validate_log_level_rejects_unknown() {
        assert!(validate_log_level("verbose").is_err());
    }
}
