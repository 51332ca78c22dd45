use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

pub const JST: Tz = chrono_tz::Asia::Tokyo;

/// Length of one metering interval.
pub fn interval() -> Duration {
    Duration::minutes(30)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HalfHourReading {
    pub start_at: DateTime<Tz>,
    pub end_at: DateTime<Tz>,
    pub consumption_kwh: f64,
    pub version: Option<String>,
}

impl HalfHourReading {
    pub fn new(start_at: DateTime<Tz>, consumption_kwh: f64) -> Self {
        Self {
            start_at,
            end_at: start_at + interval(),
            consumption_kwh,
            version: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

/// Bearer token issued by the Kraken login mutation. Replaced wholesale on refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub value: String,
    pub expiry: DateTime<Utc>,
}

impl AuthToken {
    pub fn expires_within(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now + margin >= self.expiry
    }

    pub fn header_value(&self) -> String {
        format!("JWT {}", self.value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum GapPolicy {
    #[default]
    Zero,
    CarryForward,
}

impl GapPolicy {
    pub fn as_label(self) -> &'static str {
        match self {
            GapPolicy::Zero => "zero",
            GapPolicy::CarryForward => "carry-forward",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataGap {
    pub start_at: DateTime<Tz>,
    pub end_at: DateTime<Tz>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentReading {
    pub end_at: DateTime<Tz>,
    pub kwh: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardSnapshot {
    pub account_number: String,
    pub today_kwh: f64,
    pub yesterday_kwh: f64,
    pub month_to_date_kwh: f64,
    pub last_month_kwh: f64,
    pub today_cost_jpy: i64,
    pub month_to_date_cost_jpy: i64,
    pub last_half_hour_kwh: Option<f64>,
    pub power_w: Option<f64>,
    pub last_interval_end: Option<DateTime<Tz>>,
    pub total_energy_kwh: f64,
    pub recent_readings: Vec<RecentReading>,
    pub gap_count: usize,
    pub fetched_at: DateTime<Utc>,
}
