use crate::error::AppError;
use crate::models::{Credentials, GapPolicy};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use url::Url;

pub const SERVICE_NAME: &str = "oejp-meter";
pub const DEFAULT_API_URL: &str = "https://api.oejp-kraken.energy/v1/graphql/";
pub const MIN_REFRESH_SECONDS: u64 = 60;

pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

fn app_home_dir() -> Result<PathBuf, AppError> {
    if let Ok(custom) = std::env::var("OEJP_METER_HOME") {
        return Ok(PathBuf::from(custom));
    }

    if let Some(dirs) = ProjectDirs::from("jp", "oejp", SERVICE_NAME) {
        let candidate = dirs.data_local_dir().to_path_buf();
        if fs::create_dir_all(&candidate).is_ok() {
            return Ok(candidate);
        }
    }

    let cwd = std::env::current_dir()?;
    Ok(cwd.join(".oejp-meter"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub refresh_seconds: u64,
    pub api_url: String,
    pub email: String,
    pub yen_per_kwh: f64,
    pub gap_policy: GapPolicy,
    pub recent_hours: i64,
    pub token_refresh_margin_seconds: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            refresh_seconds: 1800,
            api_url: DEFAULT_API_URL.into(),
            email: String::new(),
            yen_per_kwh: 30.0,
            gap_policy: GapPolicy::Zero,
            recent_hours: 12,
            token_refresh_margin_seconds: 120,
        }
    }
}

impl AppConfig {
    /// Identifier shared by every sensor of one configured account.
    pub fn entry_id(&self) -> String {
        format!("oejp_{}", normalize_email(&self.email))
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.refresh_seconds.max(MIN_REFRESH_SECONDS))
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if !self.yen_per_kwh.is_finite() || self.yen_per_kwh < 0.0 {
            return Err(AppError::Config(
                "yen_per_kwh must be a non-negative number".into(),
            ));
        }
        let parsed = Url::parse(&self.api_url)?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(AppError::Config(format!(
                "api_url must use http or https, got '{}'",
                parsed.scheme()
            )));
        }
        if self.recent_hours <= 0 {
            return Err(AppError::Config("recent_hours must be positive".into()));
        }
        if self.token_refresh_margin_seconds < 0 {
            return Err(AppError::Config(
                "token_refresh_margin_seconds must not be negative".into(),
            ));
        }
        Ok(())
    }
}

pub fn parse_gap_policy(input: &str) -> Result<GapPolicy, AppError> {
    match input.trim().to_ascii_lowercase().as_str() {
        "zero" => Ok(GapPolicy::Zero),
        "carry-forward" | "carry_forward" => Ok(GapPolicy::CarryForward),
        _ => Err(AppError::Config(
            "Unsupported gap policy. Use zero or carry-forward.".into(),
        )),
    }
}

pub fn config_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("config"))
}

pub fn data_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("data"))
}

pub fn config_path() -> Result<PathBuf, AppError> {
    Ok(config_dir()?.join("config.toml"))
}

pub fn db_path() -> Result<PathBuf, AppError> {
    Ok(data_dir()?.join("readings.sqlite"))
}

pub fn ensure_dirs() -> Result<(), AppError> {
    fs::create_dir_all(config_dir()?)?;
    fs::create_dir_all(data_dir()?)?;
    Ok(())
}

fn normalize_config(config: &mut AppConfig) -> bool {
    let mut changed = false;

    let email = normalize_email(&config.email);
    if email != config.email {
        config.email = email;
        changed = true;
    }

    let api_url = config.api_url.trim().to_string();
    if api_url.is_empty() {
        config.api_url = DEFAULT_API_URL.into();
        changed = true;
    } else if api_url != config.api_url {
        config.api_url = api_url;
        changed = true;
    }

    changed
}

pub fn load_config() -> Result<AppConfig, AppError> {
    let path = config_path()?;
    if !path.exists() {
        return Ok(AppConfig::default());
    }

    let raw = fs::read_to_string(&path)?;
    let mut parsed: AppConfig = toml::from_str(&raw)?;
    if normalize_config(&mut parsed) {
        save_config(&parsed)?;
    }
    parsed.validate()?;

    Ok(parsed)
}

pub fn save_config(config: &AppConfig) -> Result<(), AppError> {
    ensure_dirs()?;
    let path = config_path()?;
    let raw = toml::to_string_pretty(config)?;
    fs::write(path, raw)?;
    Ok(())
}

fn keyring_entry(email: &str) -> Result<keyring::Entry, AppError> {
    let normalized = normalize_email(email);
    Ok(keyring::Entry::new(
        SERVICE_NAME,
        &format!("account:{normalized}"),
    )?)
}

pub fn set_password(email: &str, password: &str) -> Result<(), AppError> {
    keyring_entry(email)?.set_password(password)?;
    Ok(())
}

pub fn get_password(email: &str) -> Result<String, AppError> {
    match keyring_entry(email).and_then(|entry| Ok(entry.get_password()?)) {
        Ok(value) if !value.is_empty() => return Ok(value),
        Ok(_) => {}
        Err(err) => debug!(error = %err, "no password in keyring"),
    }

    if let Ok(value) = std::env::var("OEJP_PASSWORD") {
        if !value.is_empty() {
            return Ok(value);
        }
    }

    Err(AppError::Config(format!(
        "No password found for '{}'. Run configure --password or set OEJP_PASSWORD.",
        normalize_email(email)
    )))
}

pub fn credentials(cfg: &AppConfig) -> Result<Credentials, AppError> {
    if cfg.email.is_empty() {
        return Err(AppError::Config(
            "No account configured. Run configure --email <address>.".into(),
        ));
    }
    Ok(Credentials {
        email: cfg.email.clone(),
        password: get_password(&cfg.email)?,
    })
}

pub fn ensure_initialized() -> Result<(), AppError> {
    ensure_dirs()?;
    let cfg_path = config_path()?;
    if !Path::new(&cfg_path).exists() {
        save_config(&AppConfig::default())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_email_trims_and_lowercases() {
        assert_eq!(normalize_email(" Taro@Example.JP "), "taro@example.jp");
    }

    #[test]
    fn normalize_config_fills_blank_api_url_and_email_case() {
        let mut cfg = AppConfig {
            email: "Hanako@Example.jp".into(),
            api_url: "  ".into(),
            ..AppConfig::default()
        };

        assert!(normalize_config(&mut cfg));
        assert_eq!(cfg.email, "hanako@example.jp");
        assert_eq!(cfg.api_url, DEFAULT_API_URL);
        assert!(!normalize_config(&mut cfg));
    }

    #[test]
    fn validate_rejects_negative_rate_and_bad_url() {
        let cfg = AppConfig {
            yen_per_kwh: -1.0,
            ..AppConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = AppConfig {
            api_url: "ftp://example.com/graphql".into(),
            ..AppConfig::default()
        };
        let err = cfg.validate().expect_err("ftp should be rejected");
        assert!(err.to_string().contains("http or https"));

        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn config_round_trips_through_toml_with_missing_fields() {
        let cfg: AppConfig = toml::from_str("email = \"a@b.jp\"\nyen_per_kwh = 31.5\n")
            .expect("partial config parses");
        assert_eq!(cfg.email, "a@b.jp");
        assert!((cfg.yen_per_kwh - 31.5).abs() < f64::EPSILON);
        assert_eq!(cfg.refresh_seconds, 1800);
        assert_eq!(cfg.gap_policy, GapPolicy::Zero);
    }

    #[test]
    fn parse_gap_policy_accepts_both_spellings() {
        assert_eq!(parse_gap_policy("zero").unwrap(), GapPolicy::Zero);
        assert_eq!(
            parse_gap_policy("Carry_Forward").unwrap(),
            GapPolicy::CarryForward
        );
        assert!(parse_gap_policy("interpolate").is_err());
    }

    #[test]
    fn poll_interval_has_a_floor() {
        let cfg = AppConfig {
            refresh_seconds: 5,
            ..AppConfig::default()
        };
        assert_eq!(cfg.poll_interval().as_secs(), MIN_REFRESH_SECONDS);
    }

    #[test]
    fn entry_id_uses_normalized_email() {
        let cfg = AppConfig {
            email: " Taro@Example.jp".into(),
            ..AppConfig::default()
        };
        assert_eq!(cfg.entry_id(), "oejp_taro@example.jp");
    }

    mod shared_store {
        use keyring::credential::{Credential, CredentialApi, CredentialBuilderApi};
        use std::any::Any;
        use std::collections::HashMap;
        use std::sync::{Arc, Mutex};

        type Secrets = Arc<Mutex<HashMap<(String, String), Vec<u8>>>>;

        /// In-memory store whose entries see each other's writes, like a real keyring.
        #[derive(Debug, Default)]
        pub struct SharedBuilder {
            secrets: Secrets,
        }

        #[derive(Debug)]
        struct SharedCredential {
            key: (String, String),
            secrets: Secrets,
        }

        impl CredentialApi for SharedCredential {
            fn set_secret(&self, secret: &[u8]) -> keyring::Result<()> {
                self.secrets
                    .lock()
                    .unwrap()
                    .insert(self.key.clone(), secret.to_vec());
                Ok(())
            }

            fn get_secret(&self) -> keyring::Result<Vec<u8>> {
                self.secrets
                    .lock()
                    .unwrap()
                    .get(&self.key)
                    .cloned()
                    .ok_or(keyring::Error::NoEntry)
            }

            fn delete_credential(&self) -> keyring::Result<()> {
                self.secrets
                    .lock()
                    .unwrap()
                    .remove(&self.key)
                    .map(|_| ())
                    .ok_or(keyring::Error::NoEntry)
            }

            fn as_any(&self) -> &dyn Any {
                self
            }
        }

        impl CredentialBuilderApi for SharedBuilder {
            fn build(
                &self,
                _target: Option<&str>,
                service: &str,
                user: &str,
            ) -> keyring::Result<Box<Credential>> {
                Ok(Box::new(SharedCredential {
                    key: (service.to_string(), user.to_string()),
                    secrets: Arc::clone(&self.secrets),
                }))
            }

            fn as_any(&self) -> &dyn Any {
                self
            }
        }
    }

    #[test]
    fn stored_password_is_read_back_for_normalized_email() {
        keyring::set_default_credential_builder(Box::new(shared_store::SharedBuilder::default()));

        set_password(" Keyring@Example.JP ", "s3cret").expect("store password");
        assert_eq!(
            get_password("keyring@example.jp").expect("read password"),
            "s3cret"
        );

        let cfg = AppConfig {
            email: "keyring@example.jp".into(),
            ..AppConfig::default()
        };
        assert_eq!(credentials(&cfg).expect("credentials").password, "s3cret");
    }

    #[test]
    fn credentials_require_an_email() {
        let err = credentials(&AppConfig::default()).expect_err("no email configured");
        assert!(err.to_string().contains("No account configured"));
    }
}
