use crate::aggregate::AggregationSettings;
use crate::api::{EnergyApi, OctopusApi};
use crate::config::{credentials, db_path, load_config, AppConfig};
use crate::coordinator::{Coordinator, UpdateStatus};
use crate::error::AppError;
use crate::storage::Storage;
use crate::ui::app::AppState;
use chrono::Utc;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::widgets::{Block, Borders, Cell, Paragraph, Row, Table};
use ratatui::Terminal;
use std::io;
use std::time::{Duration as StdDuration, Instant};
use tracing::{info, warn};

const COLOR_ACCENT: Color = Color::Cyan;
const COLOR_INFO: Color = Color::Green;
const COLOR_WARN: Color = Color::Yellow;
const COLOR_MUTED: Color = Color::DarkGray;
const COLOR_HEADER: Color = Color::White;

pub async fn run_tui() -> Result<(), AppError> {
    let cfg = load_config()?;
    let api = OctopusApi::new(&cfg, credentials(&cfg)?)?;
    let mut coordinator = Coordinator::new(api, AggregationSettings::from(&cfg));
    let db = db_path()?;
    let mut storage = Storage::open(&db)?;

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    stdout.execute(EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let reload = || -> Result<OctopusApi, AppError> {
        let cfg = load_config()?;
        OctopusApi::new(&cfg, credentials(&cfg)?)
    };
    let loop_result = run_loop(
        &mut terminal,
        &cfg,
        &mut storage,
        &mut coordinator,
        &reload,
    )
    .await;

    disable_raw_mode()?;
    terminal.backend_mut().execute(LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    loop_result
}

async fn run_loop<A, F>(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    cfg: &AppConfig,
    storage: &mut Storage,
    coordinator: &mut Coordinator<A>,
    reload: &F,
) -> Result<(), AppError>
where
    A: EnergyApi,
    F: Fn() -> Result<A, AppError>,
{
    let mut state = AppState::default();
    let entry_id = cfg.entry_id();
    let tick_rate = cfg.poll_interval();
    info!(interval_secs = tick_rate.as_secs(), "dashboard started");

    refresh_dashboard(&mut state, &entry_id, storage, coordinator, reload).await;
    let mut last_tick = Instant::now();

    while state.running {
        terminal.draw(|f| render(f, &state))?;

        let timeout = tick_rate
            .checked_sub(last_tick.elapsed())
            .unwrap_or_else(|| StdDuration::from_millis(0));

        let mut refresh_now = false;
        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                refresh_now = handle_key(key.code, key.modifiers, &mut state);
            }
        }

        if state.running && (refresh_now || last_tick.elapsed() >= tick_rate) {
            refresh_dashboard(&mut state, &entry_id, storage, coordinator, reload).await;
            last_tick = Instant::now();
        }
    }

    Ok(())
}

/// Applies a key press; returns true when a refresh was requested.
fn handle_key(code: KeyCode, modifiers: KeyModifiers, state: &mut AppState) -> bool {
    match code {
        KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => {
            state.running = false;
            false
        }
        KeyCode::Char('q') | KeyCode::Esc => {
            state.running = false;
            false
        }
        KeyCode::Char('r') | KeyCode::Enter => {
            state.retry_auth = true;
            true
        }
        KeyCode::Char('z') => {
            state.compact_mode = !state.compact_mode;
            false
        }
        _ => false,
    }
}

async fn refresh_dashboard<A, F>(
    state: &mut AppState,
    entry_id: &str,
    storage: &mut Storage,
    coordinator: &mut Coordinator<A>,
    reload: &F,
) where
    A: EnergyApi,
    F: Fn() -> Result<A, AppError>,
{
    // A manual refresh after an auth failure picks up credentials saved by `configure`.
    if std::mem::take(&mut state.retry_auth) && coordinator.is_auth_failed() {
        match reload() {
            Ok(api) => {
                info!("reloaded credentials after auth failure");
                coordinator.replace_api(api);
            }
            Err(err) => {
                warn!(error = %err, "could not reload credentials");
                state.status = format!("reload failed: {err}");
                return;
            }
        }
    }
    let _ = coordinator.refresh(storage, Utc::now()).await;
    state.status = match coordinator.status() {
        UpdateStatus::AuthFailed(_) => format!(
            "{} (run configure, then press r)",
            coordinator.status().label()
        ),
        status => status.label(),
    };
    state
        .view
        .update(coordinator.sensors(entry_id), coordinator.snapshot());
}

fn kpi_text(state: &AppState, key: &str) -> String {
    state
        .view
        .sensor(key)
        .map(|s| s.display_value())
        .unwrap_or_else(|| "unavailable".into())
}

fn render(f: &mut ratatui::Frame, state: &AppState) {
    let size = f.area();
    let compact = state.compact_mode || size.width < 100;

    let root = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(5),
            Constraint::Min(6),
            Constraint::Length(2),
        ])
        .split(size);

    let header = Paragraph::new(format!(
        " oejp-meter  ·  {}  ·  {} ",
        state.status, state.view.last_refresh
    ))
    .block(Block::default().borders(Borders::ALL).title(" Session "))
    .style(Style::default().fg(COLOR_HEADER));
    f.render_widget(header, root[0]);

    let kpis = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(34),
            Constraint::Percentage(33),
            Constraint::Percentage(33),
        ])
        .split(root[1]);

    let today = Paragraph::new(kpi_text(state, "today_kwh"))
        .block(Block::default().borders(Borders::ALL).title(" Today "))
        .style(Style::default().fg(COLOR_INFO).add_modifier(Modifier::BOLD));
    let cost = Paragraph::new(kpi_text(state, "today_cost_jpy"))
        .block(Block::default().borders(Borders::ALL).title(" Cost Today "))
        .style(
            Style::default()
                .fg(COLOR_ACCENT)
                .add_modifier(Modifier::BOLD),
        );
    let power = Paragraph::new(kpi_text(state, "power_w"))
        .block(Block::default().borders(Borders::ALL).title(" Power "))
        .style(Style::default().fg(COLOR_WARN).add_modifier(Modifier::BOLD));

    f.render_widget(today, kpis[0]);
    f.render_widget(cost, kpis[1]);
    f.render_widget(power, kpis[2]);

    let body = Layout::default()
        .direction(Direction::Horizontal)
        .constraints(if compact {
            [Constraint::Percentage(70), Constraint::Percentage(30)]
        } else {
            [Constraint::Percentage(60), Constraint::Percentage(40)]
        })
        .split(root[2]);

    let sensor_rows = state
        .view
        .sensors
        .iter()
        .map(|s| {
            let mut cells = vec![Cell::from(s.name), Cell::from(s.display_value())];
            if !compact {
                cells.push(Cell::from(
                    s.state_class
                        .map(|c| format!("{c:?}"))
                        .unwrap_or_else(|| "-".into()),
                ));
            }
            Row::new(cells)
        })
        .collect::<Vec<_>>();
    let sensor_widths = if compact {
        vec![Constraint::Percentage(55), Constraint::Percentage(45)]
    } else {
        vec![
            Constraint::Percentage(40),
            Constraint::Percentage(30),
            Constraint::Percentage(30),
        ]
    };
    let sensor_header = if compact {
        Row::new(vec!["Sensor", "Value"])
    } else {
        Row::new(vec!["Sensor", "Value", "State class"])
    };
    let sensor_table = Table::new(sensor_rows, sensor_widths)
        .header(
            sensor_header.style(
                Style::default()
                    .fg(Color::Yellow)
                    .add_modifier(Modifier::BOLD),
            ),
        )
        .block(Block::default().borders(Borders::ALL).title(" Sensors "));
    f.render_widget(sensor_table, body[0]);

    let recent_rows = state
        .view
        .recent
        .iter()
        .map(|(end, kwh)| {
            Row::new(vec![
                Cell::from(end.clone()),
                Cell::from(format!("{kwh:.3}")),
            ])
        })
        .collect::<Vec<_>>();
    let recent_table = Table::new(
        recent_rows,
        [Constraint::Percentage(60), Constraint::Percentage(40)],
    )
    .header(
        Row::new(vec!["Ends", "kWh"]).style(
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        ),
    )
    .block(Block::default().borders(Borders::ALL).title(if compact {
        " Recent "
    } else {
        " Recent Half Hours "
    }));
    f.render_widget(recent_table, body[1]);

    let footer = Paragraph::new(footer_text(state))
        .block(Block::default().borders(Borders::ALL))
        .style(Style::default().fg(COLOR_MUTED));
    f.render_widget(footer, root[3]);
}

fn footer_text(state: &AppState) -> String {
    let keys = "r refresh | z compact | q quit";
    match state.view.gap_count {
        0 => keys.to_string(),
        n => format!("{keys} | {n} missing interval(s) in range"),
    }
}
