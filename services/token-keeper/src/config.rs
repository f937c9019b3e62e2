//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The app secret and permanent code are loaded from `APP_SECRET` /
//! `PERMANENT_CODE` env vars or from secret files, never stored in the TOML
//! directly to avoid leaking them. `CURRENT_OPENUSER_ID` and `API_QUERY_URL`
//! override the probe identity and path.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use fxiaoke_auth::{
    AppCredential, DEFAULT_BASE_URL, DEFAULT_PROBE_PATH, DEFAULT_TIMEOUT_SECS, GatewayConfig,
};
use fxiaoke_token::{ManagerConfig, ProbeSettings, RetryPolicy};
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewaySection,
    pub app: AppSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub probe: ProbeSection,
    #[serde(default)]
    pub server: ServerSection,
}

/// Open-API gateway transport settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    pub base_url: String,
    pub timeout_secs: u64,
    /// Skip TLS certificate verification. Never on unless set explicitly.
    pub danger_accept_invalid_certs: bool,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            danger_accept_invalid_certs: false,
        }
    }
}

/// The corporate integration whose token is kept
#[derive(Debug, Deserialize)]
pub struct AppSection {
    pub app_id: String,
    /// Open user id the validation probe runs as
    #[serde(default)]
    pub current_open_user_id: String,
    /// Path to a file holding the app secret (alternative to APP_SECRET)
    #[serde(default)]
    pub app_secret_file: Option<PathBuf>,
    /// Path to a file holding the permanent code (alternative to PERMANENT_CODE)
    #[serde(default)]
    pub permanent_code_file: Option<PathBuf>,
    #[serde(skip)]
    pub app_secret: Option<Secret<String>>,
    #[serde(skip)]
    pub permanent_code: Option<Secret<String>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    File,
}

impl StoreBackend {
    pub fn label(self) -> &'static str {
        match self {
            StoreBackend::Memory => "memory",
            StoreBackend::File => "file",
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub backend: StoreBackend,
    /// Token file, required for the file backend
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_invalidations: u32,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_invalidations: policy.max_invalidations,
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
        }
    }
}

/// Validation probe settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProbeSection {
    /// Gateway path the probe is posted to
    pub path: String,
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self {
            path: DEFAULT_PROBE_PATH.to_string(),
        }
    }
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub listen_addr: SocketAddr,
    pub max_connections: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_connections: 256,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Secret resolution order, per secret:
    /// 1. `APP_SECRET` / `PERMANENT_CODE` env var
    /// 2. `app_secret_file` / `permanent_code_file` path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env_overrides();
        config.validate()?;

        config.app.app_secret = Some(resolve_secret(
            "APP_SECRET",
            config.app.app_secret_file.as_deref(),
        )?);
        config.app.permanent_code = Some(resolve_secret(
            "PERMANENT_CODE",
            config.app.permanent_code_file.as_deref(),
        )?);

        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(user_id) = non_blank_env("CURRENT_OPENUSER_ID") {
            self.app.current_open_user_id = user_id;
        }
        if let Some(path) = non_blank_env("API_QUERY_URL") {
            self.probe.path = path;
        }
    }

    fn validate(&self) -> common::Result<()> {
        if self.app.app_id.trim().is_empty() {
            return Err(common::Error::Config("app.app_id must not be empty".into()));
        }

        if !self.gateway.base_url.starts_with("http://")
            && !self.gateway.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                self.gateway.base_url
            )));
        }

        if self.gateway.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(common::Error::Config(
                "retry.max_attempts must be greater than 0".into(),
            ));
        }

        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(common::Error::Config(format!(
                "retry.max_delay_ms ({}) must be >= retry.base_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.base_delay_ms
            )));
        }

        if self.store.backend == StoreBackend::File && self.store.path.is_none() {
            return Err(common::Error::Config(
                "store.path is required when store.backend = \"file\"".into(),
            ));
        }

        if !self.probe.path.starts_with('/') {
            return Err(common::Error::Config(format!(
                "probe.path must start with /, got: {}",
                self.probe.path
            )));
        }

        if self.app.current_open_user_id.trim().is_empty() {
            return Err(common::Error::Config(
                "app.current_open_user_id must not be empty (or set CURRENT_OPENUSER_ID)".into(),
            ));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("fxiaoke-token-keeper.toml")
    }

    /// Credentials for the configured app. Fails if secrets were not resolved.
    pub fn credential(&self) -> common::Result<AppCredential> {
        let app_secret = self
            .app
            .app_secret
            .clone()
            .ok_or(common::Error::MissingSecret("APP_SECRET"))?;
        let permanent_code = self
            .app
            .permanent_code
            .clone()
            .ok_or(common::Error::MissingSecret("PERMANENT_CODE"))?;
        Ok(AppCredential::new(
            self.app.app_id.clone(),
            app_secret,
            permanent_code,
        ))
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            base_url: self.gateway.base_url.clone(),
            timeout: Duration::from_secs(self.gateway.timeout_secs),
            danger_accept_invalid_certs: self.gateway.danger_accept_invalid_certs,
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            retry: RetryPolicy {
                max_invalidations: self.retry.max_invalidations,
                max_attempts: self.retry.max_attempts,
                base_delay: Duration::from_millis(self.retry.base_delay_ms),
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
            },
            probe: ProbeSettings {
                path: self.probe.path.clone(),
                current_open_user_id: self.app.current_open_user_id.clone(),
                ..ProbeSettings::default()
            },
            operation_timeout: Duration::from_secs(self.gateway.timeout_secs),
        }
    }
}

fn non_blank_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

/// Env var wins over file; blank values count as missing.
fn resolve_secret(env_var: &'static str, file: Option<&Path>) -> common::Result<Secret<String>> {
    if let Ok(value) = std::env::var(env_var) {
        let secret = Secret::new(value);
        if !secret.is_blank() {
            return Ok(secret);
        }
    }

    if let Some(path) = file {
        let value = std::fs::read_to_string(path).map_err(|e| {
            common::Error::Config(format!(
                "failed to read secret file for {env_var} at {}: {e}",
                path.display()
            ))
        })?;
        let value = value.trim().to_owned();
        if !value.is_empty() {
            return Ok(Secret::new(value));
        }
    }

    Err(common::Error::MissingSecret(env_var))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Mutex to serialize tests that mutate environment variables, preventing
    /// data races when tests run in parallel.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    /// Set both secrets through the environment.
    fn with_env_secrets() {
        unsafe {
            set_env("APP_SECRET", "env-secret");
            set_env("PERMANENT_CODE", "env-perm");
        }
    }

    fn clear_env_secrets() {
        unsafe {
            remove_env("APP_SECRET");
            remove_env("PERMANENT_CODE");
        }
    }

    fn minimal_toml() -> &'static str {
        r#"
[app]
app_id = "FSAID_1"
current_open_user_id = "FSUID_1"
"#
    }

    fn write_config(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_load_minimal_config_applies_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, minimal_toml());
        with_env_secrets();

        let config = Config::load(&path).unwrap();
        clear_env_secrets();

        assert_eq!(config.app.app_id, "FSAID_1");
        assert_eq!(config.gateway.base_url, "https://open.fxiaoke.com");
        assert_eq!(config.gateway.timeout_secs, 10);
        assert!(!config.gateway.danger_accept_invalid_certs);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.retry.max_invalidations, 3);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay_ms, 2000);
        assert_eq!(config.retry.max_delay_ms, 30000);
        assert_eq!(config.server.listen_addr.to_string(), "127.0.0.1:8080");
        assert_eq!(config.server.max_connections, 256);
        assert_eq!(config.probe.path, "/cgi/crm/v2/data/query");
    }

    #[test]
    fn test_load_full_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[gateway]
base_url = "http://127.0.0.1:9000"
timeout_secs = 3
danger_accept_invalid_certs = true

[app]
app_id = "FSAID_2"
current_open_user_id = "FSUID_2"

[store]
backend = "file"
path = "/var/lib/keeper/tokens.json"

[retry]
max_invalidations = 1
max_attempts = 2
base_delay_ms = 100
max_delay_ms = 400

[probe]
path = "/cgi/crm/custom/v2/data/query"

[server]
listen_addr = "0.0.0.0:9090"
max_connections = 16
"#,
        );
        with_env_secrets();

        let config = Config::load(&path).unwrap();
        clear_env_secrets();

        assert_eq!(config.store.backend, StoreBackend::File);
        assert_eq!(
            config.store.path.as_deref(),
            Some(Path::new("/var/lib/keeper/tokens.json"))
        );

        let gateway = config.gateway_config();
        assert_eq!(gateway.base_url, "http://127.0.0.1:9000");
        assert_eq!(gateway.timeout, Duration::from_secs(3));
        assert!(gateway.danger_accept_invalid_certs);

        let manager = config.manager_config();
        assert_eq!(manager.retry.max_invalidations, 1);
        assert_eq!(manager.retry.max_attempts, 2);
        assert_eq!(manager.retry.base_delay, Duration::from_millis(100));
        assert_eq!(manager.retry.max_delay, Duration::from_millis(400));
        assert_eq!(manager.probe.current_open_user_id, "FSUID_2");
        assert_eq!(manager.probe.path, "/cgi/crm/custom/v2/data/query");
        assert_eq!(manager.operation_timeout, Duration::from_secs(3));
        assert_eq!(config.server.max_connections, 16);
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(matches!(result, Err(common::Error::Io(_))));
    }

    #[test]
    fn test_load_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "not valid {{{{ toml");
        assert!(matches!(Config::load(&path), Err(common::Error::Toml(_))));
    }

    #[test]
    fn test_secrets_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, minimal_toml());
        with_env_secrets();

        let config = Config::load(&path).unwrap();
        clear_env_secrets();

        let credential = config.credential().unwrap();
        assert_eq!(credential.app_id, "FSAID_1");
        assert_eq!(credential.app_secret.expose(), "env-secret");
        assert_eq!(credential.permanent_code.expose(), "env-perm");
    }

    #[test]
    fn test_secrets_from_files() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let secret_path = dir.path().join("app_secret");
        let code_path = dir.path().join("permanent_code");
        std::fs::write(&secret_path, "file-secret\n").unwrap();
        std::fs::write(&code_path, "file-perm\n").unwrap();
        let path = write_config(
            &dir,
            &format!(
                r#"
[app]
app_id = "FSAID_1"
current_open_user_id = "FSUID_1"
app_secret_file = "{}"
permanent_code_file = "{}"
"#,
                secret_path.display(),
                code_path.display()
            ),
        );
        clear_env_secrets();

        let credential = Config::load(&path).unwrap().credential().unwrap();
        assert_eq!(credential.app_secret.expose(), "file-secret");
        assert_eq!(credential.permanent_code.expose(), "file-perm");
    }

    #[test]
    fn test_env_secret_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let secret_path = dir.path().join("app_secret");
        std::fs::write(&secret_path, "file-secret").unwrap();
        let path = write_config(
            &dir,
            &format!(
                r#"
[app]
app_id = "FSAID_1"
current_open_user_id = "FSUID_1"
app_secret_file = "{}"
"#,
                secret_path.display()
            ),
        );
        with_env_secrets();

        let config = Config::load(&path).unwrap();
        clear_env_secrets();

        assert_eq!(
            config.app.app_secret.as_ref().unwrap().expose(),
            "env-secret",
            "APP_SECRET env var must take precedence over app_secret_file"
        );
    }

    #[test]
    fn test_missing_secret_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, minimal_toml());
        clear_env_secrets();

        let err = Config::load(&path).unwrap_err();
        assert!(
            matches!(err, common::Error::MissingSecret("APP_SECRET")),
            "got: {err}"
        );
    }

    #[test]
    fn test_blank_secret_file_counts_as_missing() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let code_path = dir.path().join("permanent_code");
        std::fs::write(&code_path, "  \n  ").unwrap();
        let path = write_config(
            &dir,
            &format!(
                r#"
[app]
app_id = "FSAID_1"
current_open_user_id = "FSUID_1"
permanent_code_file = "{}"
"#,
                code_path.display()
            ),
        );
        unsafe {
            set_env("APP_SECRET", "env-secret");
            remove_env("PERMANENT_CODE");
        }

        let err = Config::load(&path).unwrap_err();
        clear_env_secrets();
        assert!(matches!(err, common::Error::MissingSecret("PERMANENT_CODE")));
    }

    #[test]
    fn test_unreadable_secret_file_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[app]
app_id = "FSAID_1"
current_open_user_id = "FSUID_1"
app_secret_file = "/nonexistent/path/app_secret"
"#,
        );
        clear_env_secrets();

        let err = Config::load(&path).unwrap_err();
        assert!(
            err.to_string().contains("failed to read secret file"),
            "got: {err}"
        );
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[gateway]
base_url = "open.fxiaoke.com"

[app]
app_id = "FSAID_1"
"#,
        );
        with_env_secrets();

        let err = Config::load(&path).unwrap_err();
        clear_env_secrets();
        assert!(
            err.to_string().contains("base_url must start with http"),
            "error message should explain the issue, got: {err}"
        );
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[gateway]
timeout_secs = 0

[app]
app_id = "FSAID_1"
"#,
        );
        with_env_secrets();

        let result = Config::load(&path);
        clear_env_secrets();
        assert!(result.is_err(), "timeout_secs = 0 must be rejected");
    }

    #[test]
    fn test_empty_app_id_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[app]\napp_id = \"  \"\n");
        with_env_secrets();

        let result = Config::load(&path);
        clear_env_secrets();
        assert!(matches!(result, Err(common::Error::Config(_))));
    }

    #[test]
    fn test_max_delay_below_base_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[app]
app_id = "FSAID_1"

[retry]
base_delay_ms = 5000
max_delay_ms = 1000
"#,
        );
        with_env_secrets();

        let err = Config::load(&path).unwrap_err();
        clear_env_secrets();
        assert!(err.to_string().contains("max_delay_ms"), "got: {err}");
    }

    #[test]
    fn test_file_backend_requires_path() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[app]
app_id = "FSAID_1"

[store]
backend = "file"
"#,
        );
        with_env_secrets();

        let err = Config::load(&path).unwrap_err();
        clear_env_secrets();
        assert!(err.to_string().contains("store.path"), "got: {err}");
    }

    #[test]
    fn test_blank_open_user_id_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "[app]\napp_id = \"FSAID_1\"\ncurrent_open_user_id = \"  \"\n",
        );
        with_env_secrets();
        unsafe { remove_env("CURRENT_OPENUSER_ID") };

        let err = Config::load(&path).unwrap_err();
        clear_env_secrets();
        assert!(
            matches!(err, common::Error::Config(ref msg) if msg.contains("current_open_user_id")),
            "got: {err}"
        );
    }

    #[test]
    fn test_query_env_overrides_file() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "[app]\napp_id = \"FSAID_1\"\n");
        with_env_secrets();
        unsafe {
            set_env("CURRENT_OPENUSER_ID", "FSUID_env");
            set_env("API_QUERY_URL", "/cgi/crm/custom/v2/data/query");
        }

        let result = Config::load(&path);
        clear_env_secrets();
        unsafe {
            remove_env("CURRENT_OPENUSER_ID");
            remove_env("API_QUERY_URL");
        }

        let probe = result.unwrap().manager_config().probe;
        assert_eq!(probe.current_open_user_id, "FSUID_env");
        assert_eq!(probe.path, "/cgi/crm/custom/v2/data/query");
    }

    #[test]
    fn test_relative_query_path_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[app]
app_id = "FSAID_1"
current_open_user_id = "FSUID_1"

[probe]
path = "cgi/crm/v2/data/query"
"#,
        );
        with_env_secrets();
        unsafe { remove_env("API_QUERY_URL") };

        let err = Config::load(&path).unwrap_err();
        clear_env_secrets();
        assert!(err.to_string().contains("probe.path"), "got: {err}");
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            "[app]\napp_id = \"FSAID_1\"\n\n[store]\nbackend = \"mongo\"\n",
        );
        assert!(matches!(Config::load(&path), Err(common::Error::Toml(_))));
    }

    #[test]
    fn test_resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn test_resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("/env/path.toml"));
        unsafe { remove_env("CONFIG_PATH") };
    }

    #[test]
    fn test_resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        let path = Config::resolve_path(None);
        assert_eq!(path, PathBuf::from("fxiaoke-token-keeper.toml"));
    }

    #[test]
    fn test_resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/should-lose.toml") };
        let path = Config::resolve_path(Some("/cli/wins.toml"));
        assert_eq!(
            path,
            PathBuf::from("/cli/wins.toml"),
            "CLI arg must take precedence over CONFIG_PATH env var"
        );
        unsafe { remove_env("CONFIG_PATH") };
    }
}
