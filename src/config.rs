use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use directories::BaseDirs;
use serde::Deserialize;
use tracing::warn;

use crate::remote::http::DEFAULT_CONNECT_TIMEOUT;
use crate::remote::Credentials;
use crate::sync::ExternalSource;

const CONFIG_FILE_NAME: &str = "config.toml";
const APP_NAME: &str = "carddav-mirror";

#[derive(Debug, Clone)]
pub struct Config {
    pub config_path: PathBuf,
    /// `None` means the default location under the data directory.
    pub db_path: Option<PathBuf>,
    pub log_level: Option<String>,
    pub http: HttpConfig,
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    pub connect_timeout: Duration,
    /// Whole-request limit; `None` means no limit.
    pub request_timeout: Option<Duration>,
}

/// One `[[sources]]` entry after validation.
#[derive(Clone)]
pub struct SourceConfig {
    pub id: String,
    pub name: String,
    pub url: String,
    pub username: String,
    pub account_id: String,
    password: PasswordSource,
}

#[derive(Clone)]
enum PasswordSource {
    Plain(String),
    Command(String),
}

impl std::fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let password = match &self.password {
            PasswordSource::Plain(_) => "<redacted>".to_string(),
            PasswordSource::Command(cmd) => format!("command `{}`", cmd),
        };
        f.debug_struct("SourceConfig")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("url", &self.url)
            .field("username", &self.username)
            .field("account_id", &self.account_id)
            .field("password", &password)
            .finish()
    }
}

impl SourceConfig {
    /// The configured password, running `password_command` if that is how it
    /// was given.
    pub fn get_password(&self) -> Result<String> {
        match &self.password {
            PasswordSource::Plain(password) => Ok(password.clone()),
            PasswordSource::Command(cmd) => {
                let output = Command::new("sh")
                    .arg("-c")
                    .arg(cmd)
                    .output()
                    .with_context(|| format!("failed to run password command for `{}`", self.id))?;
                if !output.status.success() {
                    bail!(
                        "password command for `{}` exited with {}",
                        self.id,
                        output.status
                    );
                }
                let stdout = String::from_utf8(output.stdout)
                    .with_context(|| format!("password command for `{}` printed invalid UTF-8", self.id))?;
                Ok(stdout.trim().to_string())
            }
        }
    }

    pub fn to_external_source(&self) -> Result<ExternalSource> {
        Ok(ExternalSource {
            id: self.id.clone(),
            name: self.name.clone(),
            url: self.url.clone(),
            credentials: Credentials::new(self.username.as_str(), self.get_password()?),
            account_id: self.account_id.clone(),
        })
    }
}

impl Config {
    pub fn source(&self, id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.id == id)
    }
}

/// Expand ~ to home directory in paths
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = home::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

// =============================================================================
// File format
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    db_path: Option<PathBuf>,
    account_id: Option<String>,
    log_level: Option<String>,
    http: HttpFile,
    sources: Vec<SourceFile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HttpFile {
    connect_timeout_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SourceFile {
    id: String,
    name: Option<String>,
    url: String,
    username: String,
    password: Option<String>,
    password_command: Option<String>,
    account_id: Option<String>,
}

fn config_root() -> Result<PathBuf> {
    let base = BaseDirs::new().context("unable to determine base directories")?;
    Ok(base.config_dir().join(APP_NAME))
}

pub fn config_path() -> Result<PathBuf> {
    Ok(config_root()?.join(CONFIG_FILE_NAME))
}

/// Load from `path`, or from the default location when `None`.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => config_path()?,
    };
    if !path.exists() {
        bail!(
            "configuration file not found at {}. Please create it as per docs.",
            path.display()
        );
    }

    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read configuration file at {}", path.display()))?;

    from_toml_str(&raw, path.clone())
        .with_context(|| format!("invalid configuration in {}", path.display()))
}

pub fn from_toml_str(raw: &str, config_path: PathBuf) -> Result<Config> {
    let value: toml::Value = toml::from_str(raw).context("failed to parse configuration as TOML")?;

    warn_unknown_keys(&value);

    let file: ConfigFile = value
        .try_into()
        .context("failed to deserialize configuration")?;

    if file.sources.is_empty() {
        bail!("at least one [[sources]] entry must be configured");
    }

    let default_account = file
        .account_id
        .as_deref()
        .map(str::trim)
        .filter(|a| !a.is_empty());

    let mut seen = HashSet::new();
    let mut sources = Vec::with_capacity(file.sources.len());
    for source in file.sources {
        let id = source.id.trim().to_string();
        if id.is_empty() {
            bail!("every source needs a non-empty `id`");
        }
        if !seen.insert(id.clone()) {
            bail!("duplicate source id `{}`", id);
        }

        let url = source.url.trim().to_string();
        if url.is_empty() {
            bail!("source `{}` has an empty `url`", id);
        }

        let account_id = source
            .account_id
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .or(default_account)
            .ok_or_else(|| anyhow!("source `{}` has no `account_id` and no default is set", id))?
            .to_string();

        let password = match (source.password, source.password_command) {
            (Some(password), None) => PasswordSource::Plain(password),
            (None, Some(cmd)) if !cmd.trim().is_empty() => PasswordSource::Command(cmd),
            (None, Some(_)) => bail!("source `{}` has an empty `password_command`", id),
            (Some(_), Some(_)) => {
                bail!("source `{}` sets both `password` and `password_command`", id)
            }
            (None, None) => bail!("source `{}` needs `password` or `password_command`", id),
        };

        let name = source
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| id.clone());

        sources.push(SourceConfig {
            id,
            name,
            url,
            username: source.username,
            account_id,
            password,
        });
    }

    let http = HttpConfig {
        connect_timeout: file
            .http
            .connect_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT),
        request_timeout: file.http.request_timeout_secs.map(Duration::from_secs),
    };

    let log_level = file
        .log_level
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty());

    Ok(Config {
        config_path,
        db_path: file.db_path.as_deref().map(expand_tilde),
        log_level,
        http,
        sources,
    })
}

// =============================================================================
// Unknown key warnings
// =============================================================================

fn warn_unknown_keys(value: &toml::Value) {
    let Some(table) = value.as_table() else {
        return;
    };

    warn_unknown_in(
        table,
        &["db_path", "account_id", "log_level", "http", "sources"],
        "",
    );

    if let Some(http) = table.get("http").and_then(|v| v.as_table()) {
        warn_unknown_in(
            http,
            &["connect_timeout_secs", "request_timeout_secs"],
            "http.",
        );
    }

    if let Some(sources) = table.get("sources").and_then(|v| v.as_array()) {
        for source in sources.iter().filter_map(|s| s.as_table()) {
            warn_unknown_in(
                source,
                &[
                    "id",
                    "name",
                    "url",
                    "username",
                    "password",
                    "password_command",
                    "account_id",
                ],
                "sources.",
            );
        }
    }
}

fn warn_unknown_in(table: &toml::map::Map<String, toml::Value>, known: &[&str], prefix: &str) {
    for key in table.keys() {
        if !known.contains(&key.as_str()) {
            warn!("unknown configuration key `{}{}`", prefix, key);
        }
    }
}
