use crate::aggregate::{build_snapshot, previous_month_start, AggregationSettings};
use crate::api::EnergyApi;
use crate::error::AppError;
use crate::models::{AuthToken, DashboardSnapshot, HalfHourReading, JST};
use crate::sensor::{read_all, SensorState};
use crate::storage::Storage;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    Pending,
    Ok,
    /// Last cycle failed; sensors keep showing the previous snapshot.
    Degraded(String),
    /// Credentials rejected twice. No further requests until `reset_auth`.
    AuthFailed(String),
}

impl UpdateStatus {
    pub fn label(&self) -> String {
        match self {
            UpdateStatus::Pending => "pending".into(),
            UpdateStatus::Ok => "ok".into(),
            UpdateStatus::Degraded(reason) => format!("degraded: {reason}"),
            UpdateStatus::AuthFailed(reason) => format!("auth failed: {reason}"),
        }
    }
}

/// Owns the cached token and the last good snapshot for one account.
pub struct Coordinator<A: EnergyApi> {
    api: A,
    settings: AggregationSettings,
    token: Option<AuthToken>,
    snapshot: Option<DashboardSnapshot>,
    status: UpdateStatus,
}

impl<A: EnergyApi> Coordinator<A> {
    pub fn new(api: A, settings: AggregationSettings) -> Self {
        Self {
            api,
            settings,
            token: None,
            snapshot: None,
            status: UpdateStatus::Pending,
        }
    }

    pub fn snapshot(&self) -> Option<&DashboardSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn status(&self) -> &UpdateStatus {
        &self.status
    }

    pub fn is_auth_failed(&self) -> bool {
        matches!(self.status, UpdateStatus::AuthFailed(_))
    }

    pub fn reset_auth(&mut self) {
        if self.is_auth_failed() {
            self.status = UpdateStatus::Pending;
        }
        self.token = None;
    }

    /// Swaps in a client built from reloaded credentials and clears any auth failure.
    pub fn replace_api(&mut self, api: A) {
        self.api = api;
        self.reset_auth();
    }

    pub fn sensors(&self, entry_id: &str) -> Vec<SensorState> {
        read_all(entry_id, self.snapshot(), self.is_auth_failed())
    }

    pub async fn refresh(
        &mut self,
        storage: &mut Storage,
        now: DateTime<Utc>,
    ) -> Result<&DashboardSnapshot, AppError> {
        if let UpdateStatus::AuthFailed(reason) = &self.status {
            return Err(AppError::Auth(reason.clone()));
        }

        let end = now.with_timezone(&JST);
        let start = previous_month_start(end);

        let readings = match self.fetch_once(start, end, now).await {
            Ok(readings) => readings,
            Err(err) if err.is_auth() => {
                warn!(error = %err, "token rejected, re-authenticating once");
                self.token = None;
                match self.fetch_once(start, end, now).await {
                    Ok(readings) => readings,
                    Err(err) => return Err(self.record_failure(err)),
                }
            }
            Err(err) => return Err(self.record_failure(err)),
        };

        let total_energy_kwh = match storage.record_cycle(&readings) {
            Ok(total) => total,
            Err(err) => return Err(self.record_failure(err)),
        };

        let account_number = self.api.account_number().unwrap_or_default().to_string();
        let snapshot = build_snapshot(
            &account_number,
            &readings,
            now,
            &self.settings,
            total_energy_kwh,
        );
        info!(
            readings = readings.len(),
            today_kwh = snapshot.today_kwh,
            "update cycle complete"
        );
        self.status = UpdateStatus::Ok;
        Ok(&*self.snapshot.insert(snapshot))
    }

    async fn fetch_once(
        &mut self,
        start: DateTime<Tz>,
        end: DateTime<Tz>,
        now: DateTime<Utc>,
    ) -> Result<Vec<HalfHourReading>, AppError> {
        let token = match self.token.take() {
            Some(token) => self.api.ensure_valid(token, now).await?,
            None => self.api.obtain_token().await?,
        };
        let token = self.token.insert(token);
        self.api.fetch_readings(token, start, end).await
    }

    fn record_failure(&mut self, err: AppError) -> AppError {
        if err.is_auth() {
            error!(error = %err, "authentication failed after retry");
            self.token = None;
            self.status = UpdateStatus::AuthFailed(err.to_string());
        } else {
            warn!(
                error = %err,
                keeping_snapshot = self.snapshot.is_some(),
                "update cycle failed"
            );
            self.status = UpdateStatus::Degraded(err.to_string());
        }
        err
    }

    #[cfg(test)]
    fn api(&self) -> &A {
        &self.api
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fake::FakeApi;
    use crate::models::GapPolicy;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn now() -> DateTime<Utc> {
        JST.with_ymd_and_hms(2024, 5, 2, 1, 5, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn day_readings() -> Vec<HalfHourReading> {
        let midnight = JST.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();
        vec![
            HalfHourReading::new(midnight, 0.5),
            HalfHourReading::new(midnight + Duration::minutes(30), 0.3),
        ]
    }

    fn settings() -> AggregationSettings {
        AggregationSettings {
            yen_per_kwh: 30.0,
            gap_policy: GapPolicy::Zero,
            recent_hours: 12,
        }
    }

    fn storage() -> (TempDir, Storage) {
        let tmp = TempDir::new().expect("tempdir");
        let storage = Storage::open(&tmp.path().join("readings.sqlite")).expect("storage");
        (tmp, storage)
    }

    #[tokio::test]
    async fn refresh_builds_snapshot_and_reuses_token() {
        let api = FakeApi::default()
            .login_ok()
            .fetch(Ok(day_readings()))
            .fetch(Ok(day_readings()));
        let mut coordinator = Coordinator::new(api, settings());
        let (_tmp, mut storage) = storage();

        let snap = coordinator
            .refresh(&mut storage, now())
            .await
            .expect("first refresh");
        assert!((snap.today_kwh - 0.8).abs() < 1e-9);
        assert_eq!(snap.today_cost_jpy, 24);
        assert_eq!(snap.account_number, "A-TEST");
        assert!((snap.total_energy_kwh - 0.8).abs() < 1e-9);

        let snap = coordinator
            .refresh(&mut storage, now() + Duration::minutes(30))
            .await
            .expect("second refresh");
        assert!((snap.total_energy_kwh - 0.8).abs() < 1e-9);

        assert_eq!(coordinator.api().login_calls, 1);
        assert_eq!(coordinator.api().ensure_calls, 1);
        assert_eq!(coordinator.status(), &UpdateStatus::Ok);
    }

    #[tokio::test]
    async fn fetch_failure_keeps_last_known_snapshot() {
        let api = FakeApi::default()
            .login_ok()
            .fetch(Ok(day_readings()))
            .fetch(Err(AppError::Fetch("HTTP 502".into())));
        let mut coordinator = Coordinator::new(api, settings());
        let (_tmp, mut storage) = storage();

        let before = coordinator
            .refresh(&mut storage, now())
            .await
            .expect("first refresh")
            .clone();
        let err = coordinator
            .refresh(&mut storage, now())
            .await
            .expect_err("second refresh fails");

        assert!(matches!(err, AppError::Fetch(_)));
        assert_eq!(coordinator.snapshot(), Some(&before));
        assert!(matches!(coordinator.status(), UpdateStatus::Degraded(_)));
        assert!(coordinator
            .sensors("oejp_test")
            .iter()
            .all(|s| s.available));
    }

    #[tokio::test]
    async fn rejected_token_triggers_one_relogin() {
        let api = FakeApi::default()
            .login_ok()
            .login_ok()
            .fetch(Err(AppError::Auth("UNAUTHENTICATED".into())))
            .fetch(Ok(day_readings()));
        let mut coordinator = Coordinator::new(api, settings());
        let (_tmp, mut storage) = storage();

        coordinator
            .refresh(&mut storage, now())
            .await
            .expect("recovers after relogin");
        assert_eq!(coordinator.api().login_calls, 2);
        assert_eq!(coordinator.api().fetch_calls, 2);
    }

    #[tokio::test]
    async fn repeated_auth_failure_is_persistent_until_reset() {
        let api = FakeApi::default().login_err().login_err();
        let mut coordinator = Coordinator::new(api, settings());
        let (_tmp, mut storage) = storage();

        let err = coordinator
            .refresh(&mut storage, now())
            .await
            .expect_err("auth fails");
        assert!(err.is_auth());
        assert!(coordinator.is_auth_failed());
        assert_eq!(coordinator.api().login_calls, 2);

        let calls_before = coordinator.api().calls();
        let err = coordinator
            .refresh(&mut storage, now())
            .await
            .expect_err("still failed");
        assert!(err.is_auth());
        assert_eq!(coordinator.api().calls(), calls_before);
        assert!(coordinator.sensors("oejp_test").iter().all(|s| !s.available));

        coordinator.reset_auth();
        assert_eq!(coordinator.status(), &UpdateStatus::Pending);
    }

    #[tokio::test]
    async fn replaced_credentials_recover_from_auth_failure() {
        let api = FakeApi::default().login_err().login_err();
        let mut coordinator = Coordinator::new(api, settings());
        let (_tmp, mut storage) = storage();
        assert!(coordinator.refresh(&mut storage, now()).await.is_err());
        assert!(coordinator.is_auth_failed());

        coordinator.replace_api(FakeApi::default().login_ok().fetch(Ok(day_readings())));
        let snap = coordinator
            .refresh(&mut storage, now())
            .await
            .expect("new credentials work");
        assert!((snap.today_kwh - 0.8).abs() < 1e-9);
        assert_eq!(coordinator.status(), &UpdateStatus::Ok);
        assert!(coordinator.sensors("oejp_test").iter().all(|s| s.available));
    }

    #[tokio::test]
    async fn total_energy_counts_interval_published_in_later_cycle() {
        let midnight = JST.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();
        let first = vec![
            HalfHourReading::new(midnight, 0.5),
            HalfHourReading::new(midnight + Duration::hours(1), 0.2),
        ];
        let second = vec![
            HalfHourReading::new(midnight, 0.5),
            HalfHourReading::new(midnight + Duration::minutes(30), 0.4),
            HalfHourReading::new(midnight + Duration::hours(1), 0.2),
        ];
        let api = FakeApi::default()
            .login_ok()
            .fetch(Ok(first))
            .fetch(Ok(second));
        let mut coordinator = Coordinator::new(api, settings());
        let (_tmp, mut storage) = storage();
        let later = now() + Duration::minutes(30);

        let snap = coordinator.refresh(&mut storage, later).await.expect("first");
        assert!((snap.total_energy_kwh - 0.7).abs() < 1e-9);
        assert_eq!(snap.gap_count, 1);

        let snap = coordinator.refresh(&mut storage, later).await.expect("second");
        assert!((snap.total_energy_kwh - 1.1).abs() < 1e-9);
        assert!((snap.total_energy_kwh - snap.today_kwh).abs() < 1e-9);
        assert_eq!(snap.gap_count, 0);
    }
}
