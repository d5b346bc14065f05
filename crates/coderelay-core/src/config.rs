use std::{fs, path::Path, path::PathBuf, time::Duration};

use anyhow::{anyhow, Context, Result};
use coderelay_schema::Platform;
use serde::{Deserialize, Serialize};

use crate::workdir::{absolutize, expand_home};

fn default_platform() -> String {
    "telegram".to_string()
}

fn default_binary() -> String {
    "claude".to_string()
}

fn default_cwd() -> PathBuf {
    PathBuf::from("./_tmp")
}

fn default_permission_mode() -> String {
    "bypassPermissions".to_string()
}

fn default_inactivity_timeout_secs() -> u64 {
    1800
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_pacing_ms() -> u64 {
    500
}

fn default_settings_path() -> PathBuf {
    PathBuf::from("user_settings.json")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_binary")]
    pub binary: String,
    #[serde(default = "default_cwd")]
    pub default_cwd: PathBuf,
    #[serde(default = "default_permission_mode")]
    pub permission_mode: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            default_cwd: default_cwd(),
            permission_mode: default_permission_mode(),
            system_prompt: None,
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,
}

impl SessionsConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            pacing_ms: default_pacing_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsConfig {
    #[serde(default = "default_settings_path")]
    pub path: PathBuf,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            path: default_settings_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramChannelConfig {
    pub token: String,
    /// Empty means everyone may talk to the bot
    #[serde(default)]
    pub allowed_users: Vec<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub telegram: Option<TelegramChannelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub settings: SettingsConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
}

impl RelayConfig {
    pub fn platform(&self) -> Platform {
        Platform::from_tag(&self.platform)
    }

    pub fn default_working_directory(&self) -> PathBuf {
        absolutize(&self.agent.default_cwd)
    }
}

pub fn resolve_env_var(raw: &str) -> String {
    let mut output = String::new();
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);

        let candidate = &rest[start + 2..];
        let Some(end) = candidate.find('}') else {
            output.push_str(&rest[start..]);
            return output;
        };

        let key = &candidate[..end];
        output.push_str(&std::env::var(key).unwrap_or_default());
        rest = &candidate[end + 1..];
    }

    output.push_str(rest);
    output
}

fn resolve_env_path(path: &Path) -> PathBuf {
    PathBuf::from(resolve_env_var(&path.to_string_lossy()))
}

/// Reads, resolves and validates the config file.
///
/// A relative settings path is taken relative to the config file's directory.
pub fn load_config(path: &Path) -> Result<RelayConfig> {
    let mut config: RelayConfig = read_yaml_file(path)?;
    resolve_config_env(&mut config);

    let settings_path = expand_home(&config.settings.path);
    if settings_path.is_relative() {
        if let Some(dir) = path.parent() {
            config.settings.path = dir.join(settings_path);
        }
    } else {
        config.settings.path = settings_path;
    }

    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &RelayConfig) -> Result<()> {
    match config.platform() {
        Platform::Telegram => {
            let telegram = config
                .channels
                .telegram
                .as_ref()
                .ok_or_else(|| anyhow!("platform is telegram but channels.telegram is missing"))?;
            if telegram.token.trim().is_empty() {
                return Err(anyhow!("channels.telegram.token is empty"));
            }
        }
        other => return Err(anyhow!("unsupported platform: {other}")),
    }

    if config.agent.binary.trim().is_empty() {
        return Err(anyhow!("agent.binary is empty"));
    }
    if config.sessions.sweep_interval_secs == 0 || config.sessions.inactivity_timeout_secs == 0 {
        return Err(anyhow!(
            "sessions.sweep_interval_secs and sessions.inactivity_timeout_secs must be positive"
        ));
    }
    Ok(())
}

fn read_yaml_file<T>(path: &Path) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse yaml file: {}", path.display()))
}

fn resolve_config_env(config: &mut RelayConfig) {
    config.platform = resolve_env_var(&config.platform);
    config.agent.binary = resolve_env_var(&config.agent.binary);
    config.agent.default_cwd = resolve_env_path(&config.agent.default_cwd);
    config.agent.system_prompt = config.agent.system_prompt.as_deref().map(resolve_env_var);
    config.settings.path = resolve_env_path(&config.settings.path);
    if let Some(telegram) = config.channels.telegram.as_mut() {
        telegram.token = resolve_env_var(&telegram.token);
    }
}
