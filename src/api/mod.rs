use crate::config::AppConfig;
use crate::error::AppError;
use crate::models::{AuthToken, Credentials, HalfHourReading, JST};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use std::time::Instant;

pub mod auth;
#[cfg(test)]
pub mod fake;
pub mod graphql;
pub mod usage;

use auth::AuthClient;
use graphql::GraphqlClient;
use usage::UsageFetcher;

pub struct ConnectionReport {
    pub account_number: String,
    pub readings: usize,
    pub duration_ms: u128,
}

/// The energy provider as seen by the coordinator.
#[async_trait]
pub trait EnergyApi: Send {
    async fn obtain_token(&mut self) -> Result<AuthToken, AppError>;

    async fn ensure_valid(
        &mut self,
        token: AuthToken,
        now: DateTime<Utc>,
    ) -> Result<AuthToken, AppError>;

    async fn fetch_readings(
        &mut self,
        token: &AuthToken,
        start: DateTime<Tz>,
        end: DateTime<Tz>,
    ) -> Result<Vec<HalfHourReading>, AppError>;

    fn account_number(&self) -> Option<&str>;

    /// Logs in and pulls the last hour of readings.
    async fn test_connection(&mut self) -> Result<ConnectionReport, AppError> {
        let started = Instant::now();
        let token = self.obtain_token().await?;
        let end = Utc::now().with_timezone(&JST);
        let readings = self
            .fetch_readings(&token, end - Duration::hours(1), end)
            .await?;
        Ok(ConnectionReport {
            account_number: self.account_number().unwrap_or_default().to_string(),
            readings: readings.len(),
            duration_ms: started.elapsed().as_millis(),
        })
    }
}

pub struct OctopusApi {
    credentials: Credentials,
    auth: AuthClient,
    usage: UsageFetcher,
}

impl OctopusApi {
    pub fn new(cfg: &AppConfig, credentials: Credentials) -> Result<Self, AppError> {
        let graphql = GraphqlClient::new(&cfg.api_url)?;
        Ok(Self {
            credentials,
            auth: AuthClient::new(
                graphql.clone(),
                Duration::seconds(cfg.token_refresh_margin_seconds),
            ),
            usage: UsageFetcher::new(graphql),
        })
    }
}

#[async_trait]
impl EnergyApi for OctopusApi {
    async fn obtain_token(&mut self) -> Result<AuthToken, AppError> {
        self.auth.obtain_token(&self.credentials).await
    }

    async fn ensure_valid(
        &mut self,
        token: AuthToken,
        now: DateTime<Utc>,
    ) -> Result<AuthToken, AppError> {
        self.auth.ensure_valid(&self.credentials, token, now).await
    }

    async fn fetch_readings(
        &mut self,
        token: &AuthToken,
        start: DateTime<Tz>,
        end: DateTime<Tz>,
    ) -> Result<Vec<HalfHourReading>, AppError> {
        self.usage.fetch_readings(token, start, end).await
    }

    fn account_number(&self) -> Option<&str> {
        self.usage.cached_account_number()
    }
}
