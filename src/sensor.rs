use crate::models::DashboardSnapshot;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Energy,
    Power,
    Monetary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateClass {
    Measurement,
    Total,
    TotalIncreasing,
}

pub struct SensorDescription {
    pub key: &'static str,
    pub name: &'static str,
    pub unit: &'static str,
    pub device_class: Option<DeviceClass>,
    pub state_class: Option<StateClass>,
    /// Adds `last_interval_end_jst` to the attributes.
    pub interval_based: bool,
    pub value: fn(&DashboardSnapshot) -> Option<f64>,
}

// The last half hour is an interval value, not a total, so it carries no energy classes.
pub const SENSORS: [SensorDescription; 9] = [
    SensorDescription {
        key: "last_half_hour_kwh",
        name: "OEJP Last half hour",
        unit: "kWh",
        device_class: None,
        state_class: None,
        interval_based: true,
        value: |s| s.last_half_hour_kwh,
    },
    SensorDescription {
        key: "power_w",
        name: "OEJP Power estimate",
        unit: "W",
        device_class: Some(DeviceClass::Power),
        state_class: Some(StateClass::Measurement),
        interval_based: true,
        value: |s| s.power_w,
    },
    SensorDescription {
        key: "today_kwh",
        name: "OEJP Today",
        unit: "kWh",
        device_class: Some(DeviceClass::Energy),
        state_class: Some(StateClass::Total),
        interval_based: false,
        value: |s| Some(s.today_kwh),
    },
    SensorDescription {
        key: "yesterday_kwh",
        name: "OEJP Yesterday",
        unit: "kWh",
        device_class: Some(DeviceClass::Energy),
        state_class: Some(StateClass::Total),
        interval_based: false,
        value: |s| Some(s.yesterday_kwh),
    },
    SensorDescription {
        key: "month_to_date_kwh",
        name: "OEJP Month to date",
        unit: "kWh",
        device_class: Some(DeviceClass::Energy),
        state_class: Some(StateClass::Total),
        interval_based: false,
        value: |s| Some(s.month_to_date_kwh),
    },
    SensorDescription {
        key: "last_month_kwh",
        name: "OEJP Last month",
        unit: "kWh",
        device_class: Some(DeviceClass::Energy),
        state_class: Some(StateClass::Total),
        interval_based: false,
        value: |s| Some(s.last_month_kwh),
    },
    SensorDescription {
        key: "today_cost_jpy",
        name: "OEJP Cost today",
        unit: "JPY",
        device_class: Some(DeviceClass::Monetary),
        state_class: Some(StateClass::Total),
        interval_based: false,
        value: |s| Some(s.today_cost_jpy as f64),
    },
    SensorDescription {
        key: "month_to_date_cost_jpy",
        name: "OEJP Cost month to date",
        unit: "JPY",
        device_class: Some(DeviceClass::Monetary),
        state_class: Some(StateClass::Total),
        interval_based: false,
        value: |s| Some(s.month_to_date_cost_jpy as f64),
    },
    SensorDescription {
        key: "total_energy_kwh",
        name: "OEJP Total energy",
        unit: "kWh",
        device_class: Some(DeviceClass::Energy),
        state_class: Some(StateClass::TotalIncreasing),
        interval_based: false,
        value: |s| Some(s.total_energy_kwh),
    },
];

/// What the host sees for one sensor on one update.
#[derive(Debug, Clone, Serialize)]
pub struct SensorState {
    pub unique_id: String,
    pub name: &'static str,
    pub unit: &'static str,
    pub device_class: Option<DeviceClass>,
    pub state_class: Option<StateClass>,
    pub value: Option<f64>,
    pub available: bool,
    pub attributes: BTreeMap<&'static str, String>,
}

impl SensorState {
    pub fn display_value(&self) -> String {
        match (self.available, self.value) {
            (true, Some(v)) if self.unit == "JPY" => format!("¥{v:.0}"),
            (true, Some(v)) if self.unit == "W" => format!("{v:.1} W"),
            (true, Some(v)) => format!("{v:.3} {}", self.unit),
            (true, None) => "unknown".into(),
            (false, _) => "unavailable".into(),
        }
    }
}

pub fn read(
    description: &SensorDescription,
    entry_id: &str,
    snapshot: Option<&DashboardSnapshot>,
    auth_failed: bool,
) -> SensorState {
    let mut attributes = BTreeMap::new();
    let (value, available) = match snapshot {
        Some(snap) if !auth_failed => {
            attributes.insert("account_number", snap.account_number.clone());
            if description.interval_based {
                if let Some(end) = snap.last_interval_end {
                    attributes.insert("last_interval_end_jst", end.to_rfc3339());
                }
            }
            ((description.value)(snap), true)
        }
        _ => (None, false),
    };

    SensorState {
        unique_id: format!("{entry_id}_{}", description.key),
        name: description.name,
        unit: description.unit,
        device_class: description.device_class,
        state_class: description.state_class,
        value,
        available,
        attributes,
    }
}

pub fn read_all(
    entry_id: &str,
    snapshot: Option<&DashboardSnapshot>,
    auth_failed: bool,
) -> Vec<SensorState> {
    SENSORS
        .iter()
        .map(|d| read(d, entry_id, snapshot, auth_failed))
        .collect()
}
