use crate::api::graphql::{GraphqlClient, OBTAIN_TOKEN};
use crate::error::AppError;
use crate::models::{AuthToken, Credentials};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};
use tracing::{debug, info};

/// Lifetime assumed for tokens whose `exp` claim cannot be read.
const FALLBACK_TOKEN_LIFETIME_MINUTES: i64 = 60;

pub struct AuthClient {
    graphql: GraphqlClient,
    refresh_margin: Duration,
}

impl AuthClient {
    pub fn new(graphql: GraphqlClient, refresh_margin: Duration) -> Self {
        Self {
            graphql,
            refresh_margin,
        }
    }

    pub async fn obtain_token(&self, credentials: &Credentials) -> Result<AuthToken, AppError> {
        let data = self
            .graphql
            .post(
                &OBTAIN_TOKEN,
                json!({
                    "input": {
                        "email": credentials.email,
                        "password": credentials.password,
                    }
                }),
                None,
            )
            .await?;

        let value = data
            .get("obtainKrakenToken")
            .and_then(|obj| obj.get("token"))
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AppError::Auth("login failed: no token returned".into()))?
            .to_string();

        let expiry = jwt_expiry(&value)
            .unwrap_or_else(|| Utc::now() + Duration::minutes(FALLBACK_TOKEN_LIFETIME_MINUTES));
        info!(%expiry, "obtained kraken token");

        Ok(AuthToken { value, expiry })
    }

    /// Returns `token` untouched unless it expires within the refresh margin.
    pub async fn ensure_valid(
        &self,
        credentials: &Credentials,
        token: AuthToken,
        now: DateTime<Utc>,
    ) -> Result<AuthToken, AppError> {
        if !token.expires_within(now, self.refresh_margin) {
            return Ok(token);
        }
        debug!(expiry = %token.expiry, "token near expiry, re-login");
        self.obtain_token(credentials).await
    }
}

/// Reads the `exp` claim of a JWT without verifying its signature.
pub fn jwt_expiry(token: &str) -> Option<DateTime<Utc>> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return None;
    }
    let payload = URL_SAFE_NO_PAD
        .decode(parts[1].trim_end_matches('='))
        .ok()?;
    let claims: Value = serde_json::from_slice(&payload).ok()?;
    let exp = claims.get("exp")?;
    let secs = exp.as_i64().or_else(|| exp.as_f64().map(|f| f as i64))?;
    Utc.timestamp_opt(secs, 0).single()
}
