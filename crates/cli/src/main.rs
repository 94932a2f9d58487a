use std::{cell::RefCell, path::PathBuf, time::Duration, time::Instant};

use anyhow::{Context, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use core_model::{
    RecordKey, RecordStore, SessionRecord, SiteVisitRecord, Timestamp, day_of, parse_day,
};
use legacy_kv::JsonFileKv;
use maintenance::RetentionPolicy;
use migrate::MigrationPhase;
use store_sqlite::SqliteStore;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracker::{NoopSync, OTHER_APPS, SessionTracker};

mod backend;
mod config;

use backend::Backend;
use config::{Config, LogFormat, LoggingConfig};

#[derive(Parser)]
#[command(name = "focus")]
#[command(about = "Local store for focus sessions, streaks and site time")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Config file (default: <config dir>/focus/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// SQLite database, overriding the config file
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// Legacy JSON store, overriding the config file
    #[arg(long, global = true)]
    legacy: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    Init,
    Migrate,
    Cleanup {
        #[arg(long)]
        max_sessions: Option<usize>,
    },
    Validate {
        #[arg(long, default_value_t = false)]
        repair: bool,
    },
    Doctor,
    Sessions {
        #[command(subcommand)]
        command: SessionsCommand,
    },
    Session {
        #[command(subcommand)]
        command: SessionCommand,
    },
    Streak,
}

#[derive(Subcommand)]
enum SessionsCommand {
    List {
        /// First day, YYYY-MM-DD
        #[arg(long)]
        from: Option<String>,
        /// Last day, YYYY-MM-DD
        #[arg(long)]
        to: Option<String>,
    },
    Show {
        start: Timestamp,
    },
}

#[derive(Subcommand)]
enum SessionCommand {
    Start,
    End,
    Distraction,
    /// Credit time to a site, e.g. `visit docs.rs 15m`
    Visit {
        site: String,
        duration: String,
    },
    /// Credit time spent outside the browser
    Leave {
        duration: String,
    },
    Status,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    init_logging(&config.logging);
    let t = Instant::now();

    let db_path = cli
        .db
        .or(config.storage.db_path.clone())
        .unwrap_or_else(SqliteStore::default_path);
    let legacy_path = cli
        .legacy
        .or(config.storage.legacy_path.clone())
        .unwrap_or_else(JsonFileKv::default_path);

    info!(path = %db_path.display(), "opening database");
    let (mut store, created) = Backend::open(SqliteStore::new(&db_path))?;
    if !created.is_empty() {
        info!(collections = ?created, "created collections");
    }

    if !store.is_degraded()
        && legacy_path.exists()
        && !matches!(cli.command, Commands::Migrate)
        && let Err(e) = run_migration(&legacy_path, &mut store)
    {
        warn!(error = %e, "legacy migration failed; will retry next run");
    }

    match cli.command {
        Commands::Init => {
            info!(elapsed = ?t.elapsed(), "initialized");
            for collection in &created {
                println!("created {collection}");
            }
        }
        Commands::Migrate => {
            if store.is_degraded() {
                bail!("refusing to migrate into the in-memory store");
            }
            run_migration(&legacy_path, &mut store)?;
        }
        Commands::Cleanup { max_sessions } => {
            let policy = RetentionPolicy {
                max_sessions: max_sessions.unwrap_or(config.retention.max_sessions),
            };
            let (mut store, active) = with_active_start(store);
            let report = maintenance::cleanup(&mut store, &policy, active)?;
            info!(elapsed = ?t.elapsed(), "cleanup done");
            println!(
                "examined={} evicted={} cascaded={}",
                report.examined,
                report.evicted.len(),
                report.cascaded
            );
        }
        Commands::Validate { repair } => {
            let (mut store, active) = with_active_start(store);
            let issues = maintenance::validate_data(&store, active);
            println!("{}", serde_json::to_string_pretty(&issues)?);
            if repair && !issues.is_empty() {
                let removed = maintenance::repair_invalid(&mut store, &issues)?;
                println!("removed={removed}");
            }
        }
        Commands::Doctor => {
            info!("running integrity check");
            let (store, active) = with_active_start(store);
            let check = store.integrity_check()?;
            let sessions = store.count::<SessionRecord>()?;
            let visits = store.count::<SiteVisitRecord>()?;
            let issues = maintenance::validate_data(&store, active);
            info!(elapsed = ?t.elapsed(), "integrity check done");
            println!("integrity_check={check}");
            println!("degraded={}", store.is_degraded());
            println!("sessions={sessions}");
            println!("site_visits={visits}");
            println!("invalid_sessions={}", issues.len());
        }
        Commands::Sessions { command } => match command {
            SessionsCommand::List { from, to } => {
                let sessions: Vec<SessionRecord> = if from.is_none() && to.is_none() {
                    store.get_all()?
                } else {
                    let lower = day_arg(from.as_deref(), "0000-01-01")?;
                    let upper = day_arg(to.as_deref(), "9999-12-31")?;
                    store.get_all_by_index("date", &lower, &upper)?
                };
                info!(sessions = sessions.len(), "sessions listed");
                for s in &sessions {
                    println!(
                        "{} {} {} distractions={}",
                        s.start_time.map_or_else(|| "-".to_string(), |v| v.to_string()),
                        s.date.as_deref().unwrap_or("-"),
                        s.duration
                            .map_or_else(|| "active".to_string(), format_ms),
                        s.distractions
                    );
                }
            }
            SessionsCommand::Show { start } => {
                let session: SessionRecord = store
                    .get(&RecordKey::Int(start))?
                    .with_context(|| format!("no session starts at {start}"))?;
                println!("{}", serde_json::to_string_pretty(&session)?);
                if let Some(id) = &session.session_id {
                    let visits: Vec<SiteVisitRecord> =
                        store.get_all_by_index("sessionId", id, id)?;
                    for v in &visits {
                        println!("{} {}", v.site, format_ms(v.time_spent as i64));
                    }
                }
            }
        },
        Commands::Session { command } => {
            let now = Utc::now().timestamp_millis();
            let mut tracker =
                SessionTracker::resume(store, NoopSync).log_milestones(config.milestones.log);
            let ending = matches!(command, SessionCommand::End);
            run_session_command(&mut tracker, command, now)?;
            if ending
                && let Err(e) = maintenance::cleanup(tracker.store_mut(), &config.retention, None)
            {
                warn!(error = %e, "retention cleanup failed");
            }
        }
        Commands::Streak => {
            let today = day_of(Utc::now().timestamp_millis()).context("clock out of range")?;
            let tracker = SessionTracker::resume(store, NoopSync);
            println!("streak={}", tracker.streak(today));
        }
    }

    Ok(())
}

fn run_session_command(
    tracker: &mut SessionTracker<Backend>,
    command: SessionCommand,
    now: Timestamp,
) -> anyhow::Result<()> {
    match command {
        SessionCommand::Start => {
            let record = tracker.start_session(now)?;
            println!(
                "started {} {}",
                record.start_time.unwrap_or(now),
                record.session_id.as_deref().unwrap_or("-")
            );
        }
        SessionCommand::End => {
            let record = tracker.end_session(now).context("no session in progress")?;
            println!(
                "ended {} duration={} distractions={}",
                record.start_time.unwrap_or(now),
                record.duration.map_or_else(|| "-".to_string(), format_ms),
                record.distractions
            );
            if let Some(today) = day_of(now) {
                println!("streak={}", tracker.streak(today));
            }
        }
        SessionCommand::Distraction => {
            let count = tracker
                .report_distraction()
                .context("no session in progress")?;
            println!("distractions={count}");
        }
        SessionCommand::Visit { site, duration } => {
            let ms = parse_duration_ms(&duration)?;
            if !tracker.record_site_time(&site, ms) {
                bail!("no session in progress");
            }
            println!("{site} +{}", format_ms(ms as i64));
        }
        SessionCommand::Leave { duration } => {
            let ms = parse_duration_ms(&duration)?;
            if !tracker.record_site_time(OTHER_APPS, ms) {
                bail!("no session in progress");
            }
            println!("{} +{}", OTHER_APPS, format_ms(ms as i64));
        }
        SessionCommand::Status => {
            let Some(active) = tracker.context().active().cloned() else {
                println!("idle");
                return Ok(());
            };
            println!(
                "active {} {} elapsed={} distractions={}",
                active.start_time,
                active.session_id,
                format_ms(now - active.start_time),
                active.distractions
            );
            for (site, ms) in tracker.context().site_visits() {
                println!("  {site} {}", format_ms(*ms as i64));
            }
            for threshold in tracker.check_milestones(now) {
                println!("milestone {}", format_ms(threshold as i64));
            }
        }
    }
    Ok(())
}

/// The in-progress session is excluded from maintenance passes.
fn with_active_start(store: Backend) -> (Backend, Option<Timestamp>) {
    let tracker = SessionTracker::resume(store, NoopSync);
    let active = tracker.active_start();
    (tracker.into_store(), active)
}

fn run_migration(legacy_path: &std::path::Path, store: &mut Backend) -> anyhow::Result<()> {
    let mut legacy = JsonFileKv::open(legacy_path)
        .with_context(|| format!("opening legacy store {}", legacy_path.display()))?;
    let started = Instant::now();
    let last = RefCell::new(started);
    let report = migrate::migrate_from_legacy_store(&mut legacy, store, |phase| {
        let now = Instant::now();
        let delta = now.duration_since(*last.borrow());
        *last.borrow_mut() = now;
        match phase {
            MigrationPhase::Checking => info!(delta = ?delta, "checking migration flag"),
            MigrationPhase::Reading { entries } => {
                info!(entries, delta = ?delta, "reading legacy history")
            }
            MigrationPhase::Writing {
                sessions,
                site_visits,
            } => info!(sessions, site_visits, delta = ?delta, "writing collections"),
            MigrationPhase::Settings => info!(delta = ?delta, "writing settings"),
            MigrationPhase::Done => info!(elapsed = ?started.elapsed(), "migration finished"),
        }
    })?;
    if !report.already_completed {
        println!(
            "migrated sessions={} site_visits={} skipped={} active={}",
            report.sessions, report.site_visits, report.skipped, report.active_session
        );
    }
    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

fn day_arg(arg: Option<&str>, default: &str) -> anyhow::Result<String> {
    let Some(raw) = arg else {
        return Ok(default.to_string());
    };
    let day = parse_day(raw).with_context(|| format!("invalid day {raw:?}; expected YYYY-MM-DD"))?;
    Ok(day.format("%Y-%m-%d").to_string())
}

fn parse_duration_ms(raw: &str) -> anyhow::Result<u64> {
    let d = humantime::parse_duration(raw).with_context(|| format!("invalid duration {raw:?}"))?;
    u64::try_from(d.as_millis()).context("duration too large")
}

fn format_ms(ms: i64) -> String {
    let ms = u64::try_from(ms).unwrap_or(0);
    humantime::format_duration(Duration::from_secs(ms / 1000)).to_string()
}
