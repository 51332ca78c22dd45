use crate::api::graphql::{GraphqlClient, ACCOUNTS, HALF_HOURLY_READINGS};
use crate::error::AppError;
use crate::models::{AuthToken, HalfHourReading, JST};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use chrono_tz::Tz;
use serde_json::{json, Value};
use tracing::{debug, error, warn};

pub struct UsageFetcher {
    graphql: GraphqlClient,
    account_number: Option<String>,
}

impl UsageFetcher {
    pub fn new(graphql: GraphqlClient) -> Self {
        Self {
            graphql,
            account_number: None,
        }
    }

    pub fn cached_account_number(&self) -> Option<&str> {
        self.account_number.as_deref()
    }

    /// Resolves the first account visible to `token`, cached for the fetcher's lifetime.
    pub async fn account_number(&mut self, token: &AuthToken) -> Result<String, AppError> {
        if let Some(number) = &self.account_number {
            return Ok(number.clone());
        }

        let data = self.graphql.post(&ACCOUNTS, json!({}), Some(token)).await?;
        let number = data
            .get("viewer")
            .and_then(|v| v.get("accounts"))
            .and_then(Value::as_array)
            .and_then(|accounts| accounts.first())
            .ok_or_else(|| AppError::Auth("no accounts found".into()))?
            .get("number")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| AppError::Auth("account number missing".into()))?
            .to_string();

        debug!(account = %number, "account selected");
        self.account_number = Some(number.clone());
        Ok(number)
    }

    /// Half-hourly readings whose interval starts in `[start, end)`, ordered by start.
    pub async fn fetch_readings(
        &mut self,
        token: &AuthToken,
        start: DateTime<Tz>,
        end: DateTime<Tz>,
    ) -> Result<Vec<HalfHourReading>, AppError> {
        let account_number = self.account_number(token).await?;
        let variables = json!({
            "accountNumber": account_number,
            "fromDatetime": start.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Secs, true),
            "toDatetime": end.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Secs, true),
        });

        let data = self
            .graphql
            .post(&HALF_HOURLY_READINGS, variables, Some(token))
            .await?;
        let raw = parse_readings(&data)?;
        let readings = normalize_readings(raw, start, end);
        debug!(count = readings.len(), %start, %end, "readings fetched");
        Ok(readings)
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Tz>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&JST));
    }
    // Naive timestamps are UTC.
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc().with_timezone(&JST))
}

fn parse_value(raw: &Value) -> Option<f64> {
    match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_readings(data: &Value) -> Result<Vec<HalfHourReading>, AppError> {
    let properties = data
        .get("account")
        .and_then(|a| a.get("properties"))
        .and_then(Value::as_array)
        .ok_or_else(|| shape_error(data, "account.properties"))?;
    let property = properties
        .first()
        .ok_or_else(|| AppError::Fetch("no properties returned".into()))?;
    let supply_point = property
        .get("electricitySupplyPoints")
        .and_then(Value::as_array)
        .ok_or_else(|| shape_error(data, "electricitySupplyPoints"))?
        .first()
        .ok_or_else(|| AppError::Fetch("no electricitySupplyPoints returned".into()))?;
    let items = supply_point
        .get("halfHourlyReadings")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let start_at = item
            .get("startAt")
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
            .ok_or_else(|| shape_error(&item, "startAt"))?;
        let end_at = item
            .get("endAt")
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
            .ok_or_else(|| shape_error(&item, "endAt"))?;
        let consumption_kwh = item
            .get("value")
            .and_then(parse_value)
            .ok_or_else(|| shape_error(&item, "value"))?;
        let version = match item.get("version") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        };
        out.push(HalfHourReading {
            start_at,
            end_at,
            consumption_kwh,
            version,
        });
    }
    Ok(out)
}

fn shape_error(data: &Value, missing: &str) -> AppError {
    let dump: String = data.to_string().chars().take(1200).collect();
    error!(data = %dump, missing, "unexpected response shape");
    AppError::Fetch(format!("unexpected response shape, missing {missing}"))
}

/// Keeps `[start, end)`, clamps negatives, sorts, and lets the later duplicate win.
fn normalize_readings(
    raw: Vec<HalfHourReading>,
    start: DateTime<Tz>,
    end: DateTime<Tz>,
) -> Vec<HalfHourReading> {
    let mut kept: Vec<HalfHourReading> = raw
        .into_iter()
        .filter(|r| r.start_at >= start && r.start_at < end)
        .map(|mut r| {
            if r.consumption_kwh.is_nan() || r.consumption_kwh < 0.0 {
                warn!(start = %r.start_at, value = r.consumption_kwh, "clamping invalid consumption to zero");
                r.consumption_kwh = 0.0;
            }
            r
        })
        .collect();
    kept.sort_by_key(|r| r.start_at);

    let mut out: Vec<HalfHourReading> = Vec::with_capacity(kept.len());
    for reading in kept {
        match out.last_mut() {
            Some(last) if last.start_at == reading.start_at => *last = reading,
            _ => out.push(reading),
        }
    }
    out
}
