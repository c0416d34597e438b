//! Replays a detection dump through tracking and alerting on a simulated clock.
//!
//! Input lines look like `<frame index>: <json detection list>`; every monitor event is
//! printed to stdout as one JSON line, logs go to stderr.

use absence_monitor::{
    AlertScheduler, Config, Detection, EventBus, MonitorEvent, TrackingCoordinator,
};
use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Parser;
use crossbeam_channel::Receiver;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(version, about = "Replay a detection dump through the absence monitor")]
struct Args {
    /// Detection dump, one `<frame index>: <json>` line per frame
    input: PathBuf,

    /// JSON configuration file; command line options override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Frame rate the dump was recorded at
    #[arg(long, default_value_t = 10.0)]
    fps: f64,

    #[arg(short, long, default_value = "replay")]
    source: String,

    #[arg(long)]
    timeout_minutes: Option<i64>,

    #[arg(long)]
    max_disappeared: Option<u32>,

    #[arg(long)]
    max_distance: Option<f32>,

    /// Keep evaluating alerts after the last frame until all pending ones fired
    #[arg(long)]
    drain: bool,
}

fn parse_line(line: &str) -> anyhow::Result<(u64, Vec<Detection>)> {
    let (idx, vector) = line
        .split_once(':')
        .context("wrong file format: expected `:`")?;

    let idx = idx
        .trim()
        .parse::<u64>()
        .context("wrong file format: parse frame index failed")?;
    let dets = serde_json::from_str(vector.trim()).context("wrong file format: parse json failed")?;

    Ok((idx, dets))
}

fn flush_events(rx: &Receiver<MonitorEvent>, out: &mut impl Write) -> anyhow::Result<()> {
    for event in rx.try_iter() {
        serde_json::to_writer(&mut *out, &event)?;
        writeln!(out)?;
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "absence_monitor=info,replay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(v) = args.timeout_minutes {
        config.absence_timeout_minutes = v;
    }
    if let Some(v) = args.max_disappeared {
        config.max_disappeared_frames = v;
    }
    if let Some(v) = args.max_distance {
        config.max_match_distance = v;
    }
    config.validate()?;
    anyhow::ensure!(args.fps > 0.0, "fps must be positive");

    let events = EventBus::new(config.event_channel_capacity.max(1024));
    let rx = events.subscribe();
    let coordinator = TrackingCoordinator::new(config.tracker());
    let scheduler = AlertScheduler::new(config.alerts()).with_events(events.clone());

    let file = std::fs::File::open(&args.input)
        .with_context(|| format!("opening {}", args.input.display()))?;

    let start: DateTime<Utc> = Utc::now();
    let clock = |idx: u64| start + chrono::Duration::milliseconds((idx as f64 * 1000.0 / args.fps) as i64);
    let interval = chrono::Duration::seconds(config.alert_evaluation_interval_seconds as i64);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    let mut frames = 0u64;
    let mut now = start;
    let mut next_evaluation = start + interval;

    for (lineno, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let (idx, dets) = match parse_line(&line) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(line = lineno + 1, error = %err, "Skipping line");
                continue;
            }
        };

        now = clock(idx);
        let update = coordinator.update_at(&args.source, &dets, None, now);

        for identity in update.arrived {
            events.publish(MonitorEvent::Arrived(identity));
        }
        for identity in update.departed {
            scheduler.on_departure(&identity);
            events.publish(MonitorEvent::Departed(identity));
        }

        while now >= next_evaluation {
            scheduler.evaluate_at(next_evaluation);
            next_evaluation = next_evaluation + interval;
        }

        frames += 1;
        flush_events(&rx, &mut out)?;
    }

    if args.drain {
        while !scheduler.pending_alerts().is_empty() {
            now = next_evaluation;
            scheduler.evaluate_at(now);
            next_evaluation = next_evaluation + interval;
        }
        flush_events(&rx, &mut out)?;
    }

    let stats = coordinator.statistics();
    let alerts = scheduler.statistics();
    tracing::info!(
        frames,
        simulated_secs = (now - start).num_seconds(),
        tracked = stats.total_tracked,
        active = stats.total_active,
        triggered = alerts.total_triggered,
        pending = alerts.total_pending,
        "Replay finished"
    );

    Ok(())
}
