use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;
use tabled::{builder::Builder, Table, Tabled};

use strainguard::aggregation::{local_day_range, Metric, ObservationAggregator};
use strainguard::alerts::recent_highlights;
use strainguard::config::EngineConfig;
use strainguard::error::StrainError;
use strainguard::feed;
use strainguard::logging::{init_logging, LogLevel};
use strainguard::models::{HourlyObservation, PersonProfile};
use strainguard::session::{accumulator_key, Session};
use strainguard::storage::{self, DocumentStore, FileLocalStore, LocalStore, SqliteDocumentStore};
use strainguard::survey::{SurveyBlock, SurveyGate};

/// StrainGuard - wearable fatigue and heat-strain monitoring
///
/// Replays wristband recordings through the assessment engine and queries the
/// resulting fatigue and heat-strain history for a person or a crew.
#[derive(Parser)]
#[command(name = "strainguard")]
#[command(version)]
#[command(about = "Fatigue and heat-strain monitoring engine", long_about = None)]
struct Cli {
    /// Sets a custom config file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Increase verbosity of output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a recorded sensor stream (kind,value,timestamp CSV) through a session
    Replay {
        /// Input CSV file
        #[arg(short, long)]
        file: PathBuf,

        /// Person the recording belongs to
        #[arg(short, long)]
        person: String,

        /// Start from an empty accumulator instead of the committed one
        #[arg(long)]
        fresh: bool,
    },

    /// Hourly history for one person
    Observations {
        #[arg(short, long)]
        person: String,

        /// Day to show (YYYY-MM-DD, default today)
        #[arg(short, long)]
        date: Option<String>,

        #[arg(short, long, value_enum, default_value = "fatigue")]
        metric: MetricArg,
    },

    /// Hourly history for every member of a group
    Crew {
        #[arg(short, long)]
        group: String,

        /// Day to show (YYYY-MM-DD, default today)
        #[arg(short, long)]
        date: Option<String>,

        #[arg(short, long, value_enum, default_value = "fatigue")]
        metric: MetricArg,
    },

    /// Recent fatigue warnings for a group
    Highlights {
        #[arg(short, long)]
        group: String,

        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Self-report surveys
    Survey {
        #[command(subcommand)]
        action: SurveyAction,
    },

    /// Person profiles and calibration
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },

    /// Configuration file management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum SurveyAction {
    /// Show today's survey quota and eligibility
    Status,

    /// Submit a fatigue self-report
    Submit {
        #[arg(short, long)]
        person: String,

        /// Self-rated fatigue level
        #[arg(short, long)]
        level: i32,
    },

    /// Set the trial start date (YYYY-MM-DD)
    Start { date: String },
}

#[derive(Subcommand)]
enum ProfileAction {
    /// Create or update a profile; omitted fields keep their stored value
    Set {
        #[arg(short, long)]
        person: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        group: Option<String>,
        #[arg(long)]
        resting_hr: Option<i32>,
        #[arg(long)]
        critical_power: Option<i32>,
        #[arg(long)]
        total_awc: Option<i32>,
        #[arg(long)]
        k_value: Option<i32>,
        #[arg(long)]
        age: Option<u32>,
    },

    /// Print a stored profile
    Show {
        #[arg(short, long)]
        person: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    Show,
}

#[derive(Clone, Copy, ValueEnum)]
enum MetricArg {
    Fatigue,
    HeatStrain,
}

impl From<MetricArg> for Metric {
    fn from(arg: MetricArg) -> Self {
        match arg {
            MetricArg::Fatigue => Metric::Fatigue,
            MetricArg::HeatStrain => Metric::HeatStrain,
        }
    }
}

#[derive(Tabled)]
struct ObservationRow {
    #[tabled(rename = "Hour")]
    hour: String,
    #[tabled(rename = "Range")]
    range: String,
    #[tabled(rename = "Average")]
    average: String,
    #[tabled(rename = "Records")]
    records: usize,
}

impl From<&HourlyObservation> for ObservationRow {
    fn from(observation: &HourlyObservation) -> Self {
        let (range, average) = if observation.is_placeholder() {
            ("-".to_string(), "-".to_string())
        } else {
            (
                format!("{:.1} - {:.1}", observation.value_range.low, observation.value_range.high),
                format!("{:.1}", observation.average),
            )
        };
        Self {
            hour: format!("{:02}:00", observation.hour_of_day),
            range,
            average,
            records: observation.count,
        }
    }
}

#[derive(Tabled)]
struct HighlightRow {
    #[tabled(rename = "When")]
    when: String,
    #[tabled(rename = "Who")]
    who: String,
    #[tabled(rename = "Warning")]
    content: String,
}

fn now() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

fn parse_date(date: Option<&str>, config: &EngineConfig) -> Result<NaiveDate> {
    match date {
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .with_context(|| format!("Invalid date '{}', expected YYYY-MM-DD", s)),
        None => Ok(Utc::now()
            .with_timezone(&config.observations.offset())
            .date_naive()),
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load_from_file(path),
        None => Ok(EngineConfig::load_or_default()),
    }
}

fn open_stores(config: &EngineConfig) -> Result<(Arc<dyn DocumentStore>, Arc<dyn LocalStore>)> {
    let store = SqliteDocumentStore::open(&config.storage.database_path).with_context(|| {
        format!("Failed to open database: {}", config.storage.database_path.display())
    })?;
    let local = FileLocalStore::open(&config.storage.local_state_path).with_context(|| {
        format!("Failed to open local state: {}", config.storage.local_state_path.display())
    })?;
    Ok((Arc::new(store), Arc::new(local)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_ref())?;
    if cli.verbose > 0 {
        config.logging.level = LogLevel::from_verbosity(cli.verbose);
    }
    init_logging(&config.logging)?;

    match cli.command {
        Commands::Replay { file, person, fresh } => {
            let (store, local) = open_stores(&config)?;
            let samples = feed::read_samples_csv(&file)?;
            let profile = storage::load_person(store.as_ref(), &person).await?;

            println!("{}", "Replaying sensor recording...".green().bold());
            println!("  File: {}", file.display());
            println!("  Person: {} ({} samples)", person, samples.len());

            let mut session = Session::from_config(profile, &config, store, local.clone())?;
            if !fresh {
                if let Some(expenditure) = local.get_f64(&accumulator_key(&person))? {
                    session = session.with_accumulated_expenditure(expenditure);
                }
            }

            let (sender, receiver) = feed::sensor_channel(config.session.channel_capacity);
            let producer = tokio::spawn(feed::replay(samples, sender));
            let summary = session.run(receiver).await;
            producer.await.context("Sample replay task failed")?;
            session.save_accumulator(local.as_ref())?;

            let mut builder = Builder::default();
            builder.push_record(["Samples", "Rejected", "Cycles", "Alerts", "Last fatigue", "Last heat strain"]);
            builder.push_record([
                summary.samples_received.to_string(),
                summary.samples_rejected.to_string(),
                summary.cycles.to_string(),
                summary.alerts_emitted.to_string(),
                summary
                    .last_fatigue_score
                    .map(|s| format!("{}%", s.clamp(0, 100)))
                    .unwrap_or_else(|| "-".to_string()),
                summary
                    .last_heat_strain
                    .map(|s| format!("{:.2}", s))
                    .unwrap_or_else(|| "-".to_string()),
            ]);
            println!("{}", builder.build());
            println!("{}", "✓ Replay completed".green());
        }

        Commands::Observations { person, date, metric } => {
            let (store, _) = open_stores(&config)?;
            let day = parse_date(date.as_deref(), &config)?;
            let offset = config.observations.offset();
            let (start, end) = local_day_range(day, offset);
            let aggregator = ObservationAggregator::new(store, metric.into(), config.observations.window(), offset);
            let observations = aggregator.aggregate(&person, start, end, now()).await?;

            println!("{}", format!("Hourly history for {} on {}", person, day).cyan().bold());
            let rows: Vec<ObservationRow> = observations.iter().map(ObservationRow::from).collect();
            println!("{}", Table::new(rows));
        }

        Commands::Crew { group, date, metric } => {
            let (store, _) = open_stores(&config)?;
            let day = parse_date(date.as_deref(), &config)?;
            let offset = config.observations.offset();
            let (start, end) = local_day_range(day, offset);
            let aggregator = ObservationAggregator::new(store, metric.into(), config.observations.window(), offset);
            let peers = aggregator.aggregate_group(&group, start, end, now()).await?;

            if peers.is_empty() {
                println!("{}", format!("No members found in group {}", group).yellow());
                return Ok(());
            }

            println!("{}", format!("Crew {} on {}", group, day).cyan().bold());
            let mut builder = Builder::default();
            let mut header = vec!["Member".to_string()];
            header.extend(
                peers[0]
                    .observations
                    .iter()
                    .map(|o| format!("{:02}", o.hour_of_day)),
            );
            builder.push_record(header);
            for peer in &peers {
                let name = if peer.display_name.is_empty() {
                    peer.person_id.clone()
                } else {
                    peer.display_name.clone()
                };
                let mut record = vec![name];
                record.extend(peer.observations.iter().map(|o| {
                    if o.is_placeholder() {
                        "-".to_string()
                    } else {
                        format!("{:.0}", o.average)
                    }
                }));
                builder.push_record(record);
            }
            println!("{}", builder.build());
        }

        Commands::Highlights { group, limit } => {
            let (store, _) = open_stores(&config)?;
            let highlights = recent_highlights(store.as_ref(), &group, limit).await?;
            if highlights.is_empty() {
                println!("{}", "No recent warnings".green());
                return Ok(());
            }
            let now = now();
            let rows: Vec<HighlightRow> = highlights
                .iter()
                .map(|h| HighlightRow {
                    when: h.time_ago(now),
                    who: h.display_name.clone(),
                    content: h.content.clone(),
                })
                .collect();
            println!("{}", Table::new(rows));
        }

        Commands::Survey { action } => {
            let (store, local) = open_stores(&config)?;
            let gate = SurveyGate::new(local, store, config.survey, config.observations.offset());
            match action {
                SurveyAction::Status => {
                    let status = gate.status(now())?;
                    println!("{}", "Survey status".white().bold());
                    println!("  Survey day: {}", if status.survey_day { "yes".green() } else { "no".yellow() });
                    println!("  Submitted today: {}", status.submitted_today);
                    println!("  Required remaining: {}", status.required_remaining);
                    println!("  Optional remaining: {}", status.optional_remaining);
                    match status.eligibility.blocked_by {
                        None => println!("  {}", "Eligible now".green()),
                        Some(SurveyBlock::TooSoon) => {
                            let next = status
                                .eligibility
                                .next_eligible_time
                                .map(|t| strainguard::models::to_datetime(t)
                                    .with_timezone(&config.observations.offset())
                                    .format("%H:%M")
                                    .to_string())
                                .unwrap_or_default();
                            println!("  {}", format!("Next survey available at {}", next).yellow());
                        }
                        Some(block) => println!("  {}", format!("Not available: {:?}", block).yellow()),
                    }
                }
                SurveyAction::Submit { person, level } => {
                    let response = gate
                        .submit(&person, level, now())
                        .await
                        .map_err(|e| anyhow::anyhow!(e.user_message()))?;
                    println!("{}", format!("✓ Survey recorded (fatigue level {})", response.fatigue_level).green());
                }
                SurveyAction::Start { date } => {
                    let day = parse_date(Some(&date), &config)?;
                    gate.set_start_date(day)?;
                    println!("{}", format!("✓ Trial start date set to {}", day).green());
                }
            }
        }

        Commands::Profile { action } => {
            let (store, _) = open_stores(&config)?;
            match action {
                ProfileAction::Set {
                    person,
                    name,
                    group,
                    resting_hr,
                    critical_power,
                    total_awc,
                    k_value,
                    age,
                } => {
                    let mut profile = storage::load_person(store.as_ref(), &person).await?;
                    if let Some(name) = name {
                        profile.display_name = name;
                    }
                    if let Some(group) = group {
                        profile.group_id = group;
                    }
                    let calibration = &mut profile.calibration;
                    calibration.resting_heart_rate = resting_hr.unwrap_or(calibration.resting_heart_rate);
                    calibration.hr_reserve_critical_power =
                        critical_power.unwrap_or(calibration.hr_reserve_critical_power);
                    calibration.total_anaerobic_work_capacity =
                        total_awc.unwrap_or(calibration.total_anaerobic_work_capacity);
                    calibration.k_value = k_value.unwrap_or(calibration.k_value);
                    calibration.age = age.unwrap_or(calibration.age);

                    storage::save_person(store.as_ref(), &profile, now()).await?;
                    print_profile(&profile);
                    println!("{}", "✓ Profile saved".green());
                }
                ProfileAction::Show { person } => {
                    let profile = storage::find_person(store.as_ref(), &person)
                        .await
                        .map_err(|e| anyhow::anyhow!(StrainError::from(e).user_message()))?;
                    print_profile(&profile);
                }
            }
        }

        Commands::Config { action } => match action {
            ConfigAction::Init { force } => {
                let path = cli.config.unwrap_or_else(EngineConfig::default_config_path);
                if path.exists() && !force {
                    anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
                }
                let mut fresh = EngineConfig::default();
                fresh.save_to_file(&path)?;
                println!("{}", format!("✓ Configuration written to {}", path.display()).green());
            }
            ConfigAction::Show => {
                let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;
                println!("{}", rendered);
            }
        },
    }

    Ok(())
}

fn print_profile(profile: &PersonProfile) {
    let calibration = &profile.calibration;
    println!("{}", format!("Profile {}", profile.person_id).white().bold());
    println!("  Name: {}", profile.display_name);
    println!("  Group: {}", profile.group_id);
    println!("  Resting HR: {} bpm", calibration.resting_heart_rate);
    println!("  Max HR: {} bpm", calibration.max_heart_rate());
    println!("  Critical power (HRR): {}", calibration.hr_reserve_critical_power);
    println!("  Total AWC: {}", calibration.total_anaerobic_work_capacity);
    println!("  k: {}", calibration.k_value);
    if calibration.is_degenerate() {
        println!("  {}", "Calibration incomplete: fatigue scores will be meaningless".yellow());
    }
}
