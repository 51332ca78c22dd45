use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    /// Credentials rejected or the session token is no longer accepted.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Network or API failure while talking to the GraphQL endpoint.
    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Sql(#[from] rusqlite::Error),

    #[error(transparent)]
    Keyring(#[from] keyring::Error),

    #[error(transparent)]
    TomlDe(#[from] toml::de::Error),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),
}

impl AppError {
    pub fn is_auth(&self) -> bool {
        matches!(self, AppError::Auth(_))
    }
}
