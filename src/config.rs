use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::fs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Disk,
    WebDav,
}

#[derive(Clone)]
pub struct Config {
    pub discord_token: String,
    pub database_url: String,
    pub dev_guild_id: Option<u64>,
    pub register_commands: bool,

    // Attachment storage
    pub storage_backend: StorageBackend,
    pub storage_dir: String,
    pub webdav_url: Option<String>,
    pub webdav_username: Option<String>,
    pub webdav_password: Option<String>,
    pub webdav_timeout_secs: u64,
    pub webdav_retry_count: u32,

    // Attachment policy
    pub allowed_extensions: Vec<String>,
    pub max_file_size: u64,

    // Connection supervision
    pub max_retries: u32,
    pub base_retry_delay_secs: u64,
    pub enable_diagnostics: bool,

    // Background work
    pub recovery_threshold_secs: u64,
    pub scan_task_interval_secs: u64,
    pub notification_poll_secs: u64,

    // Export packaging
    pub export_volume_limit: u64,
}

const DEFAULT_ALLOWED_EXTENSIONS: &str = "json,txt,png,jpg,jpeg,gif";
const OVERRIDES_FILE: &str = "archivist.toml";

/// Optional settings file layered over the environment.
#[derive(Debug, Default, Deserialize)]
struct FileOverrides {
    allowed_extensions: Option<Vec<String>>,
    max_file_size: Option<u64>,
    export_volume_limit: Option<u64>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        let mut config = Self::build()?;
        if let Ok(content) = fs::read_to_string(OVERRIDES_FILE) {
            config.apply_overrides(&content)?;
        }
        Ok(config)
    }

    fn build() -> anyhow::Result<Self> {
        let storage_backend = match env::var("STORAGE_BACKEND")
            .unwrap_or_else(|_| "disk".to_string())
            .to_lowercase()
            .as_str()
        {
            "disk" => StorageBackend::Disk,
            "webdav" => StorageBackend::WebDav,
            other => anyhow::bail!("STORAGE_BACKEND must be 'disk' or 'webdav', got '{}'", other),
        };
        let webdav_url = env::var("WEBDAV_URL").ok();
        if storage_backend == StorageBackend::WebDav && webdav_url.is_none() {
            anyhow::bail!("WEBDAV_URL must be set when STORAGE_BACKEND=webdav");
        }

        Ok(Config {
            discord_token: env::var("DISCORD_TOKEN")
                .map_err(|_| anyhow::anyhow!("DISCORD_TOKEN must be set"))?,
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "data/archivist.db".to_string()),
            dev_guild_id: env::var("DEV_GUILD_ID").ok().and_then(|id| id.parse().ok()),
            register_commands: env::var("REGISTER_COMMANDS")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
            storage_backend,
            storage_dir: env::var("STORAGE_DIR").unwrap_or_else(|_| "data/attachments".to_string()),
            webdav_url,
            webdav_username: env::var("WEBDAV_USERNAME").ok(),
            webdav_password: env::var("WEBDAV_PASSWORD").ok(),
            webdav_timeout_secs: env::var("WEBDAV_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .unwrap_or(30),
            webdav_retry_count: env::var("WEBDAV_RETRY_COUNT")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .unwrap_or(3),
            allowed_extensions: parse_extensions(
                &env::var("ALLOWED_EXTENSIONS")
                    .unwrap_or_else(|_| DEFAULT_ALLOWED_EXTENSIONS.to_string()),
            ),
            max_file_size: env::var("MAX_FILE_SIZE")
                .unwrap_or_else(|_| "10485760".to_string())
                .parse()
                .unwrap_or(10 * 1024 * 1024),
            max_retries: env::var("MAX_RETRIES")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(10),
            base_retry_delay_secs: env::var("BASE_RETRY_DELAY_SECS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .unwrap_or(5),
            enable_diagnostics: env::var("ENABLE_DIAGNOSTICS")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
            recovery_threshold_secs: env::var("RECOVERY_THRESHOLD_SECS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()
                .unwrap_or(300),
            scan_task_interval_secs: env::var("SCAN_TASK_INTERVAL_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .unwrap_or(60),
            notification_poll_secs: env::var("NOTIFICATION_POLL_SECS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .unwrap_or(5),
            export_volume_limit: env::var("EXPORT_VOLUME_LIMIT")
                .unwrap_or_else(|_| "20971520".to_string())
                .parse()
                .unwrap_or(20 * 1024 * 1024),
        })
    }

    fn apply_overrides(&mut self, content: &str) -> anyhow::Result<()> {
        let overrides: FileOverrides = toml::from_str(content)?;
        if let Some(extensions) = overrides.allowed_extensions {
            self.allowed_extensions = extensions
                .iter()
                .map(|e| e.trim().trim_start_matches('.').to_lowercase())
                .filter(|e| !e.is_empty())
                .collect();
        }
        if let Some(size) = overrides.max_file_size {
            self.max_file_size = size;
        }
        if let Some(limit) = overrides.export_volume_limit {
            self.export_volume_limit = limit;
        }
        Ok(())
    }
}

fn parse_extensions(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|e| e.trim().trim_start_matches('.').to_lowercase())
        .filter(|e| !e.is_empty())
        .collect()
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("discord_token", &"[REDACTED]")
            .field("database_url", &self.database_url)
            .field("dev_guild_id", &self.dev_guild_id)
            .field("register_commands", &self.register_commands)
            .field("storage_backend", &self.storage_backend)
            .field("storage_dir", &self.storage_dir)
            .field("webdav_url", &self.webdav_url)
            .field("webdav_username", &self.webdav_username)
            .field(
                "webdav_password",
                &self.webdav_password.as_ref().map(|_| "[REDACTED]"),
            )
            .field("webdav_timeout_secs", &self.webdav_timeout_secs)
            .field("webdav_retry_count", &self.webdav_retry_count)
            .field("allowed_extensions", &self.allowed_extensions)
            .field("max_file_size", &self.max_file_size)
            .field("max_retries", &self.max_retries)
            .field("base_retry_delay_secs", &self.base_retry_delay_secs)
            .field("enable_diagnostics", &self.enable_diagnostics)
            .field("recovery_threshold_secs", &self.recovery_threshold_secs)
            .field("scan_task_interval_secs", &self.scan_task_interval_secs)
            .field("notification_poll_secs", &self.notification_poll_secs)
            .field("export_volume_limit", &self.export_volume_limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_config_logic() {
        // 1. Missing token
        env::remove_var("DISCORD_TOKEN");
        env::remove_var("STORAGE_BACKEND");
        let result = Config::build();
        assert!(result.is_err(), "Should fail when DISCORD_TOKEN is missing");

        // 2. Defaults
        env::set_var("DISCORD_TOKEN", "test_token");
        let config = Config::build().unwrap();
        assert_eq!(config.discord_token, "test_token");
        assert_eq!(config.storage_backend, StorageBackend::Disk);
        assert_eq!(config.base_retry_delay_secs, 5);
        assert_eq!(config.recovery_threshold_secs, 300);
        assert!(config.allowed_extensions.contains(&"png".to_string()));

        // 3. WebDAV without a URL is rejected
        env::set_var("STORAGE_BACKEND", "webdav");
        env::remove_var("WEBDAV_URL");
        assert!(Config::build().is_err());
        env::remove_var("STORAGE_BACKEND");

        // 4. Debug redaction
        env::set_var("WEBDAV_PASSWORD", "secret_password");
        let config_redacted = Config::build().unwrap();
        let debug_output = format!("{:?}", config_redacted);
        assert!(!debug_output.contains("test_token"));
        assert!(!debug_output.contains("secret_password"));
        assert!(debug_output.contains("[REDACTED]"));

        // 5. File overrides
        let mut config = Config::build().unwrap();
        config
            .apply_overrides(
                "allowed_extensions = [\".PDF\", \"zip\"]\nexport_volume_limit = 1024\n",
            )
            .unwrap();
        assert_eq!(config.allowed_extensions, vec!["pdf", "zip"]);
        assert_eq!(config.export_volume_limit, 1024);
        assert_eq!(config.max_file_size, 10 * 1024 * 1024);

        // Cleanup
        env::remove_var("DISCORD_TOKEN");
        env::remove_var("WEBDAV_PASSWORD");
    }

    #[test]
    fn test_parse_extensions() {
        assert_eq!(parse_extensions(" png, .JPG ,,txt"), vec!["png", "jpg", "txt"]);
    }
}
