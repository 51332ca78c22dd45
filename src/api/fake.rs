//! Scripted `EnergyApi` for coordinator and dashboard tests.

use super::EnergyApi;
use crate::error::AppError;
use crate::models::{AuthToken, HalfHourReading};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::collections::VecDeque;

#[derive(Default)]
pub struct FakeApi {
    logins: VecDeque<Result<AuthToken, AppError>>,
    fetches: VecDeque<Result<Vec<HalfHourReading>, AppError>>,
    pub login_calls: usize,
    pub ensure_calls: usize,
    pub fetch_calls: usize,
}

impl FakeApi {
    pub fn login_ok(mut self) -> Self {
        self.logins.push_back(Ok(AuthToken {
            value: format!("tok-{}", self.logins.len()),
            expiry: Utc.with_ymd_and_hms(2100, 1, 1, 0, 0, 0).unwrap(),
        }));
        self
    }

    pub fn login_err(mut self) -> Self {
        self.logins
            .push_back(Err(AppError::Auth("bad credentials".into())));
        self
    }

    pub fn fetch(mut self, result: Result<Vec<HalfHourReading>, AppError>) -> Self {
        self.fetches.push_back(result);
        self
    }

    pub fn calls(&self) -> usize {
        self.login_calls + self.ensure_calls + self.fetch_calls
    }
}

#[async_trait]
impl EnergyApi for FakeApi {
    async fn obtain_token(&mut self) -> Result<AuthToken, AppError> {
        self.login_calls += 1;
        self.logins
            .pop_front()
            .unwrap_or_else(|| Err(AppError::Auth("no scripted login".into())))
    }

    async fn ensure_valid(
        &mut self,
        token: AuthToken,
        _now: DateTime<Utc>,
    ) -> Result<AuthToken, AppError> {
        self.ensure_calls += 1;
        Ok(token)
    }

    async fn fetch_readings(
        &mut self,
        _token: &AuthToken,
        _start: DateTime<Tz>,
        _end: DateTime<Tz>,
    ) -> Result<Vec<HalfHourReading>, AppError> {
        self.fetch_calls += 1;
        self.fetches
            .pop_front()
            .unwrap_or_else(|| Err(AppError::Fetch("no scripted fetch".into())))
    }

    fn account_number(&self) -> Option<&str> {
        Some("A-TEST")
    }
}
