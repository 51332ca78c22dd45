mod aggregate;
mod api;
mod config;
mod coordinator;
mod error;
mod logging;
mod models;
mod sensor;
mod storage;
mod ui;

use aggregate::AggregationSettings;
use api::{EnergyApi, OctopusApi};
use chrono::Utc;
use clap::{Parser, Subcommand};
use config::{
    credentials, data_dir, db_path, ensure_initialized, load_config, normalize_email,
    parse_gap_policy, save_config, set_password,
};
use coordinator::Coordinator;
use error::AppError;
use sensor::SensorState;
use storage::Storage;
use tracing::info;
use ui::run::run_tui;

#[derive(Debug, Parser)]
#[command(name = "oejp-meter")]
#[command(about = "Half-hourly electricity usage sensors for Octopus Energy Japan")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init,
    Configure {
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        password: Option<String>,
        #[arg(long)]
        api_url: Option<String>,
        #[arg(long, allow_negative_numbers = true)]
        yen_per_kwh: Option<f64>,
        #[arg(long)]
        refresh_seconds: Option<u64>,
        #[arg(long)]
        gap_policy: Option<String>,
    },
    /// Log in and fetch the last hour of readings.
    Check,
    Refresh {
        #[arg(long, default_value = "table")]
        format: String,
    },
    Watch,
    Export {
        #[arg(long, default_value = "json")]
        format: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SensorFormat {
    Table,
    Json,
}

fn validate_sensor_format(input: &str) -> Result<SensorFormat, AppError> {
    match input.to_ascii_lowercase().as_str() {
        "table" => Ok(SensorFormat::Table),
        "json" => Ok(SensorFormat::Json),
        _ => Err(AppError::Config(
            "Unsupported refresh format. Use table or json.".into(),
        )),
    }
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

fn sensor_table(sensors: &[SensorState]) -> String {
    let mut out = format!("{:<26} {:<18} {}\n", "sensor", "value", "unique_id");
    for s in sensors {
        out.push_str(&format!(
            "{:<26} {:<18} {}\n",
            s.name,
            s.display_value(),
            s.unique_id
        ));
    }
    out
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = Cli::parse();

    let _log_guard = match cli.command {
        Commands::Watch => Some(logging::init_file(&data_dir()?, "info")?),
        _ => {
            logging::init_stderr("warn");
            None
        }
    };

    match cli.command {
        Commands::Init => {
            ensure_initialized()?;
            println!("Initialized oejp-meter config and data directories.");
        }
        Commands::Configure {
            email,
            password,
            api_url,
            yen_per_kwh,
            refresh_seconds,
            gap_policy,
        } => {
            ensure_initialized()?;
            let mut cfg = load_config()?;

            if let Some(email) = email {
                cfg.email = normalize_email(&email);
            }
            if let Some(api_url) = api_url {
                cfg.api_url = api_url.trim().to_string();
            }
            if let Some(rate) = yen_per_kwh {
                cfg.yen_per_kwh = rate;
            }
            if let Some(secs) = refresh_seconds {
                cfg.refresh_seconds = secs;
            }
            if let Some(policy) = gap_policy {
                cfg.gap_policy = parse_gap_policy(&policy)?;
            }
            cfg.validate()?;

            if let Some(password) = password {
                if cfg.email.is_empty() {
                    return Err(AppError::Config(
                        "Set --email before storing a password.".into(),
                    ));
                }
                set_password(&cfg.email, &password)?;
            }
            save_config(&cfg)?;
            info!(entry_id = %cfg.entry_id(), "configuration saved");
            println!(
                "Configured '{}' at {} JPY/kWh, refreshing every {}s ({} gaps).",
                cfg.email,
                cfg.yen_per_kwh,
                cfg.poll_interval().as_secs(),
                cfg.gap_policy.as_label()
            );
        }
        Commands::Check => {
            ensure_initialized()?;
            let cfg = load_config()?;
            let mut api = OctopusApi::new(&cfg, credentials(&cfg)?)?;
            let report = api.test_connection().await?;
            println!(
                "Authenticated account {} and fetched {} reading(s) in {} ms.",
                report.account_number, report.readings, report.duration_ms
            );
            let storage = Storage::open(&db_path()?)?;
            println!("Stored meter total: {:.3} kWh", storage.cumulative_kwh()?);
        }
        Commands::Refresh { format } => {
            let format = validate_sensor_format(&format)?;
            ensure_initialized()?;
            let cfg = load_config()?;
            let api = OctopusApi::new(&cfg, credentials(&cfg)?)?;
            let mut coordinator = Coordinator::new(api, AggregationSettings::from(&cfg));
            let db = db_path()?;
            let mut storage = Storage::open(&db)?;

            coordinator.refresh(&mut storage, Utc::now()).await?;
            let sensors = coordinator.sensors(&cfg.entry_id());
            match format {
                SensorFormat::Json => println!("{}", serde_json::to_string_pretty(&sensors)?),
                SensorFormat::Table => print!("{}", sensor_table(&sensors)),
            }
        }
        Commands::Watch => {
            ensure_initialized()?;
            run_tui().await?;
        }
        Commands::Export { format } => {
            ensure_initialized()?;
            let db = db_path()?;
            let storage = Storage::open(&db)?;
            if format.eq_ignore_ascii_case("json") {
                println!("{}", storage.export_readings_json()?);
            } else if format.eq_ignore_ascii_case("csv") {
                println!("start_at,end_at,consumption_kwh,version");
                for r in storage.readings()? {
                    println!(
                        "{},{},{:.3},{}",
                        csv_field(&r.start_at.to_rfc3339()),
                        csv_field(&r.end_at.to_rfc3339()),
                        r.consumption_kwh,
                        csv_field(r.version.as_deref().unwrap_or_default()),
                    );
                }
            } else {
                return Err(AppError::Config(
                    "Unsupported export format. Use json or csv".into(),
                ));
            }
        }
    }

    Ok(())
}
