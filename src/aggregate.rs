use crate::config::AppConfig;
use crate::models::{
    interval, DashboardSnapshot, DataGap, GapPolicy, HalfHourReading, RecentReading, JST,
};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::warn;

/// Average kW over a half hour is twice its kWh.
const KWH_PER_HALF_HOUR_TO_KW: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregationSettings {
    pub yen_per_kwh: f64,
    pub gap_policy: GapPolicy,
    pub recent_hours: i64,
}

impl From<&AppConfig> for AggregationSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            yen_per_kwh: cfg.yen_per_kwh,
            gap_policy: cfg.gap_policy,
            recent_hours: cfg.recent_hours,
        }
    }
}

pub fn last_half_hour(readings: &[HalfHourReading]) -> Option<f64> {
    readings.last().map(|r| r.consumption_kwh)
}

/// Average power over the reading's interval, in kW.
pub fn power_estimate(reading: &HalfHourReading) -> f64 {
    reading.consumption_kwh * KWH_PER_HALF_HOUR_TO_KW
}

pub fn power_estimate_watts(reading: &HalfHourReading) -> f64 {
    power_estimate(reading) * 1000.0
}

/// Total kWh of readings starting in `[start, end)`.
pub fn sum_over(readings: &[HalfHourReading], start: DateTime<Tz>, end: DateTime<Tz>) -> f64 {
    if start >= end {
        return 0.0;
    }
    readings
        .iter()
        .filter(|r| r.start_at >= start && r.start_at < end)
        .map(|r| r.consumption_kwh)
        .sum()
}

/// Cost of all `readings` at `rate` yen per kWh, rounded to whole yen.
pub fn cost(readings: &[HalfHourReading], rate: f64) -> i64 {
    let kwh: f64 = readings.iter().map(|r| r.consumption_kwh).sum();
    (kwh * rate).round() as i64
}

/// Sub-slice of ordered `readings` starting in `[start, end)`.
pub fn within(
    readings: &[HalfHourReading],
    start: DateTime<Tz>,
    end: DateTime<Tz>,
) -> &[HalfHourReading] {
    if start >= end {
        return &[];
    }
    let lo = readings.partition_point(|r| r.start_at < start);
    let hi = readings.partition_point(|r| r.start_at < end);
    &readings[lo..hi.max(lo)]
}

fn midnight(date: NaiveDate) -> DateTime<Tz> {
    let naive = date.and_time(NaiveTime::MIN);
    JST.from_local_datetime(&naive)
        .earliest()
        .unwrap_or_else(|| JST.from_utc_datetime(&naive))
}

pub fn day_start(at: DateTime<Tz>) -> DateTime<Tz> {
    midnight(at.date_naive())
}

pub fn month_start(at: DateTime<Tz>) -> DateTime<Tz> {
    let date = at.date_naive();
    midnight(NaiveDate::from_ymd_opt(date.year(), date.month(), 1).unwrap_or(date))
}

pub fn previous_month_start(at: DateTime<Tz>) -> DateTime<Tz> {
    let date = at.date_naive();
    let (year, month) = if date.month() == 1 {
        (date.year() - 1, 12)
    } else {
        (date.year(), date.month() - 1)
    };
    midnight(NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(date))
}

/// Missing intervals between consecutive readings. Nothing after the last reading counts.
pub fn find_gaps(readings: &[HalfHourReading]) -> Vec<DataGap> {
    readings
        .windows(2)
        .filter(|pair| pair[1].start_at > pair[0].end_at)
        .map(|pair| DataGap {
            start_at: pair[0].end_at,
            end_at: pair[1].start_at,
        })
        .collect()
}

/// Fills every gap with synthetic half-hour readings valued per `policy`.
pub fn apply_gap_policy(
    readings: &[HalfHourReading],
    policy: GapPolicy,
) -> (Vec<HalfHourReading>, Vec<DataGap>) {
    let gaps = find_gaps(readings);
    if gaps.is_empty() {
        return (readings.to_vec(), gaps);
    }

    let mut out = Vec::with_capacity(readings.len());
    for (idx, reading) in readings.iter().enumerate() {
        if idx > 0 {
            let prev = &readings[idx - 1];
            let fill_value = match policy {
                GapPolicy::Zero => 0.0,
                GapPolicy::CarryForward => prev.consumption_kwh,
            };
            let mut slot = prev.end_at;
            while slot < reading.start_at {
                let end_at = (slot + interval()).min(reading.start_at);
                out.push(HalfHourReading {
                    start_at: slot,
                    end_at,
                    consumption_kwh: fill_value,
                    version: None,
                });
                slot = end_at;
            }
        }
        out.push(reading.clone());
    }
    (out, gaps)
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

pub fn build_snapshot(
    account_number: &str,
    readings: &[HalfHourReading],
    now: DateTime<Utc>,
    settings: &AggregationSettings,
    total_energy_kwh: f64,
) -> DashboardSnapshot {
    let now_jst = now.with_timezone(&JST);
    let today = day_start(now_jst);
    let yesterday = today - Duration::days(1);
    let this_month = month_start(now_jst);
    let last_month = previous_month_start(now_jst);
    let recent_from = now_jst - Duration::hours(settings.recent_hours);

    let (filled, gaps) = apply_gap_policy(readings, settings.gap_policy);
    if !gaps.is_empty() {
        warn!(
            count = gaps.len(),
            first = %gaps[0].start_at,
            policy = settings.gap_policy.as_label(),
            "missing half-hour intervals"
        );
    }

    let today_readings = within(&filled, today, now_jst);
    let month_readings = within(&filled, this_month, now_jst);
    let last = filled.last();

    DashboardSnapshot {
        account_number: account_number.to_string(),
        today_kwh: round_to(sum_over(&filled, today, now_jst), 3),
        yesterday_kwh: round_to(sum_over(&filled, yesterday, today), 3),
        month_to_date_kwh: round_to(sum_over(&filled, this_month, now_jst), 3),
        last_month_kwh: round_to(sum_over(&filled, last_month, this_month), 3),
        today_cost_jpy: cost(today_readings, settings.yen_per_kwh),
        month_to_date_cost_jpy: cost(month_readings, settings.yen_per_kwh),
        last_half_hour_kwh: last_half_hour(&filled),
        power_w: last.map(|r| round_to(power_estimate_watts(r), 1)),
        last_interval_end: last.map(|r| r.end_at),
        total_energy_kwh: round_to(total_energy_kwh, 3),
        recent_readings: within(&filled, recent_from, now_jst)
            .iter()
            .map(|r| RecentReading {
                end_at: r.end_at,
                kwh: r.consumption_kwh,
            })
            .collect(),
        gap_count: gaps.len(),
        fetched_at: now,
    }
}
