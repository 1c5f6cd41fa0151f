use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};

use activity_recorder::runtime::now_ms;
use activity_recorder::{
    ActivityTemplate, Engine, JsonFileStore, LogNotifier, LogSensorHub, MotionEvent, PositionFix, Recorder,
    RecorderConfig, RecorderHandle, RepetitionMode, SessionStatus, Timestamp, UnitSystem,
};

#[derive(Parser, Debug)]
#[command(name = "activity-recorder")]
#[command(about = "Record repetitions, distance and speed of one activity", long_about = None)]
struct Args {
    /// Directory holding the in-progress snapshot and finished records
    #[arg(long, default_value = "activity_records")]
    store_dir: PathBuf,

    /// Recorder configuration (JSON), defaults when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Treat the host UI as visible
    #[arg(long, default_value_t = false)]
    foreground: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Start a new record and feed it events
    Record {
        /// Activity template (JSON)
        #[arg(long)]
        activity: PathBuf,

        /// Event log (JSON lines). Reads stdin with a live clock when omitted.
        #[arg(long)]
        events: Option<PathBuf>,

        #[arg(long, default_value = "")]
        note: String,
    },
    /// Resume the record left in progress by a previous run
    Resume {
        #[arg(long)]
        events: Option<PathBuf>,
    },
    /// Print finished records
    List,
}

/// One line of an event log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InputEvent {
    Proximity { timestamp: Timestamp, covered: bool },
    Accelerometer { timestamp: Timestamp, x: f64, y: f64, z: f64 },
    Fix(PositionFix),
    Tick { timestamp: Timestamp },
    Increment { timestamp: Timestamp },
    Note { text: String },
    Foreground { foreground: bool },
    Finish { timestamp: Timestamp },
    Cancel { timestamp: Timestamp },
}

impl InputEvent {
    fn timestamp(&self) -> Option<Timestamp> {
        match self {
            InputEvent::Proximity { timestamp, .. }
            | InputEvent::Accelerometer { timestamp, .. }
            | InputEvent::Tick { timestamp }
            | InputEvent::Increment { timestamp }
            | InputEvent::Finish { timestamp }
            | InputEvent::Cancel { timestamp } => Some(*timestamp),
            InputEvent::Fix(fix) => Some(fix.timestamp),
            InputEvent::Note { .. } | InputEvent::Foreground { .. } => None,
        }
    }
}

fn parse_line(line: &str, number: usize) -> Result<Option<InputEvent>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let event = serde_json::from_str(line).with_context(|| format!("event line {}", number))?;
    Ok(Some(event))
}

fn load_events(path: &Path) -> Result<Vec<InputEvent>> {
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut events = Vec::new();
    for (i, line) in content.lines().enumerate() {
        if let Some(event) = parse_line(line, i + 1)? {
            events.push(event);
        }
    }
    Ok(events)
}

/// Forward one event to the recorder. Returns false once the record is closed.
async fn feed(handle: &RecorderHandle, event: InputEvent, mode: RepetitionMode) -> Result<bool> {
    match event {
        InputEvent::Proximity { timestamp, covered } => {
            handle.motion(MotionEvent::proximity(timestamp, covered)).await?;
        }
        InputEvent::Accelerometer { timestamp, x, y, z } => {
            if let Some(event) = MotionEvent::from_accelerometer(timestamp, mode, x, y, z) {
                handle.motion(event).await?;
            }
        }
        InputEvent::Fix(fix) => handle.fix(fix).await?,
        InputEvent::Tick { timestamp } => handle.tick(timestamp).await?,
        InputEvent::Increment { timestamp } => {
            if let Err(err) = handle.increment(timestamp).await {
                log::warn!("increment at {} refused: {}", timestamp, err);
            }
        }
        InputEvent::Note { text } => {
            handle.set_note(&text).await?;
        }
        InputEvent::Foreground { foreground } => handle.set_foreground(foreground).await?,
        InputEvent::Finish { timestamp } => {
            handle.finish(timestamp).await?;
            return Ok(false);
        }
        InputEvent::Cancel { timestamp } => {
            handle.cancel(timestamp).await?;
            return Ok(false);
        }
    }
    Ok(true)
}

async fn replay(handle: &RecorderHandle, events: Vec<InputEvent>, mode: RepetitionMode) -> Result<()> {
    let total = events.len();
    for (i, event) in events.into_iter().enumerate() {
        if !feed(handle, event, mode).await? {
            if i + 1 < total {
                log::info!("record closed, {} trailing event(s) ignored", total - i - 1);
            }
            break;
        }
    }
    Ok(())
}

async fn follow_stdin(handle: &RecorderHandle, mode: RepetitionMode) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut number = 0;
    while let Some(line) = lines.next_line().await? {
        number += 1;
        match parse_line(&line, number) {
            Ok(Some(event)) => {
                if !feed(handle, event, mode).await? {
                    break;
                }
            }
            Ok(None) => {}
            Err(err) => log::warn!("skipping input: {:#}", err),
        }
    }
    Ok(())
}

fn print_status(status: &SessionStatus, units: UnitSystem) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(status)?);
    let (distance_unit, speed_unit) = match units {
        UnitSystem::Metric => ("m", "km/h"),
        UnitSystem::Imperial => ("yd", "mph"),
    };
    eprintln!(
        "{:?} after {:.0}s: {} repetition(s), {:.1} {}, avg {:.1} {}, max {:.1} {}",
        status.state,
        status.elapsed_secs,
        status.repetitions,
        units.distance(status.distance_m),
        distance_unit,
        units.speed(status.average_speed),
        speed_unit,
        units.speed(status.max_speed),
        speed_unit
    );
    Ok(())
}

fn list_records(store_dir: &Path, units: UnitSystem) -> Result<()> {
    let store = JsonFileStore::open(store_dir)?;
    for id in store.finished_ids()? {
        if let Some(record) = store.load_finished(&id)? {
            println!(
                "{}  {:<20} {:>4} reps  {:>9.1}  {:>6.0}s  {:?}",
                record.started_at.format("%Y-%m-%d %H:%M"),
                record.activity_name,
                record.repetitions,
                units.distance(record.distance_m),
                record.duration_secs,
                record.finished_by
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => RecorderConfig::load(path)?,
        None => RecorderConfig::default(),
    };
    let units = config.unit_system;

    let (new_record, events_path) = match args.command {
        Cmd::List => return list_records(&args.store_dir, units),
        Cmd::Record { activity, events, note } => (Some((activity, note)), events),
        Cmd::Resume { events } => (None, events),
    };
    let (events, live) = match &events_path {
        Some(path) => (load_events(path)?, false),
        None => (Vec::new(), true),
    };

    let store = JsonFileStore::open(&args.store_dir)
        .with_context(|| format!("opening store at {}", args.store_dir.display()))?;
    let tick_every = Duration::from_millis(config.tick_interval_ms);
    let engine = Engine::new(config, store, LogNotifier::new(), LogSensorHub::new());

    // Replayed logs carry their own ticks
    let (handle, recorder) = Recorder::spawn(engine, live.then_some(tick_every));
    handle.set_foreground(args.foreground).await?;

    let mode = match new_record {
        Some((activity, note)) => {
            let content = std::fs::read_to_string(&activity)
                .with_context(|| format!("reading activity {}", activity.display()))?;
            let template: ActivityTemplate = serde_json::from_str(&content)?;
            let mode = template.repetition_mode;
            let start_at = events.iter().find_map(InputEvent::timestamp).unwrap_or_else(now_ms);
            let status = handle.start(Arc::new(template), &note, start_at).await?;
            log::info!("started {} ({:?})", status.record_id, status.state);
            mode
        }
        None => match handle.recover().await? {
            Some(status) => {
                log::info!("resumed {} at {} repetition(s)", status.record_id, status.repetitions);
                status.repetition_mode
            }
            None => {
                handle.shutdown().await?;
                recorder.join().await?;
                bail!("no record in progress under {}", args.store_dir.display());
            }
        },
    };

    if live {
        follow_stdin(&handle, mode).await?;
    } else {
        replay(&handle, events, mode).await?;
    }

    let status = handle.status().await?;
    handle.shutdown().await?;
    recorder.join().await?;

    match status {
        Some(status) => print_status(&status, units)?,
        None => log::warn!("no record"),
    }
    Ok(())
}
