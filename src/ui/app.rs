use crate::models::DashboardSnapshot;
use crate::sensor::SensorState;

#[derive(Debug, Clone)]
pub struct DashboardView {
    pub sensors: Vec<SensorState>,
    pub recent: Vec<(String, f64)>,
    pub gap_count: usize,
    pub last_refresh: String,
}

impl Default for DashboardView {
    fn default() -> Self {
        Self {
            sensors: vec![],
            recent: vec![],
            gap_count: 0,
            last_refresh: "never".into(),
        }
    }
}

impl DashboardView {
    pub fn update(&mut self, sensors: Vec<SensorState>, snapshot: Option<&DashboardSnapshot>) {
        self.sensors = sensors;
        if let Some(snap) = snapshot {
            self.recent = snap
                .recent_readings
                .iter()
                .rev()
                .map(|r| (r.end_at.format("%m-%d %H:%M").to_string(), r.kwh))
                .collect();
            self.gap_count = snap.gap_count;
            self.last_refresh = snap.fetched_at.to_rfc3339();
        }
    }

    pub fn sensor(&self, key: &str) -> Option<&SensorState> {
        self.sensors
            .iter()
            .find(|s| s.unique_id.ends_with(&format!("_{key}")))
    }
}

#[derive(Debug, Clone)]
pub struct AppState {
    pub running: bool,
    pub status: String,
    pub compact_mode: bool,
    /// Set by a manual refresh; clears a persistent auth failure.
    pub retry_auth: bool,
    pub view: DashboardView,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            running: true,
            status: "ready".into(),
            compact_mode: false,
            retry_auth: false,
            view: DashboardView::default(),
        }
    }
}
