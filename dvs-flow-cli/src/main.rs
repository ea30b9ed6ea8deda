//! Replay an AEDAT event log (or a synthetic moving-edge stimulus) through
//! the optical flow pipeline, standing in for the live sensor driver.

use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use aedat_log::{AedatReader, AedatVariant, AedatWriter};
use dvs_flow_estimator::{
    FlowPipeline, RegularizationConfig, RegularizationFilter, UndistortionMap,
};
use dvs_flow_output::{flow_ring, open_flow_csv, open_serial, SinkConfig, SinkWorker, TimingLog};
use dvs_flow_types::{FlowConfig, Polarity, PolarityEvent, SensorSize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum RawFormat {
    V2,
    V3,
}

impl From<RawFormat> for AedatVariant {
    fn from(f: RawFormat) -> Self {
        match f {
            RawFormat::V2 => AedatVariant::V2,
            RawFormat::V3 => AedatVariant::V3,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "dvs-flow", about = "estimate optical flow from DVS event streams")]
struct Cli {
    /// AEDAT file to replay. A synthetic moving-edge stimulus is used when
    /// omitted.
    #[arg(long)]
    input: Option<PathBuf>,

    /// TOML configuration tree; built-in defaults when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Sensor width in pixels.
    #[arg(long, default_value_t = 128)]
    width: u16,

    /// Sensor height in pixels.
    #[arg(long, default_value_t = 128)]
    height: u16,

    /// CSV undistortion table with x,y,xu,yu rows. Identity mapping when
    /// omitted.
    #[arg(long)]
    calibration: Option<PathBuf>,

    /// Flow CSV output path.
    #[arg(long, default_value = "flow.csv")]
    flow_csv: PathBuf,

    /// Serial port device for the binary flow stream.
    #[arg(long)]
    serial_port: Option<String>,

    /// Archive the raw event stream to this AEDAT file.
    #[arg(long)]
    raw_log: Option<PathBuf>,

    /// Raw archive format variant.
    #[arg(long, value_enum, default_value = "v3")]
    raw_format: RawFormat,

    /// Per-packet timing CSV output path.
    #[arg(long)]
    timing_csv: Option<PathBuf>,

    /// Enable the neighborhood regularization filter.
    #[arg(long)]
    regularize: bool,

    /// Events per replayed packet.
    #[arg(long, default_value_t = 256)]
    packet_size: usize,

    /// Output ring capacity.
    #[arg(long, default_value_t = 1 << 14)]
    ring_capacity: usize,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => dvs_flow_types::config_from_path(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => FlowConfig::default(),
    };
    let size = SensorSize::new(cli.width, cli.height);

    let undistortion = match &cli.calibration {
        Some(path) => {
            let fd = std::fs::File::open(path)
                .with_context(|| format!("opening calibration table {}", path.display()))?;
            UndistortionMap::from_csv_reader(size, fd)?
        }
        None => UndistortionMap::identity(size),
    };

    let (tx, rx) = flow_ring(cli.ring_capacity);
    let mut pipeline = FlowPipeline::new(&cfg, size, Arc::new(undistortion), tx)?;

    if let Some(path) = &cli.raw_log {
        let capacity = aedat_log::log_capacity_events(path);
        let fd = std::fs::File::create(path)
            .with_context(|| format!("creating raw log {}", path.display()))?;
        let writer: Box<dyn std::io::Write + Send> = Box::new(BufWriter::new(fd));
        pipeline.set_raw_log(AedatWriter::new(
            writer,
            cli.raw_format.into(),
            size,
            capacity,
        )?);
    }
    if let Some(path) = &cli.timing_csv {
        pipeline.set_timing_log(TimingLog::create(path)?);
    }
    if cli.regularize {
        pipeline.set_regularizer(RegularizationFilter::new(
            RegularizationConfig::default(),
            size,
        ));
    }

    let mode = cfg.output.mode;
    let serial = if mode.has_serial() {
        let port = cli
            .serial_port
            .as_deref()
            .context("output mode requires --serial-port")?;
        Some(open_serial(port)?)
    } else {
        None
    };
    let csv_file = if mode.has_file() {
        let params_line = format!(
            "refractory_us={} dt_max_us={} dx={} n_min={} n_reject={} max_nrmse={} v_max={}",
            cfg.flow.refractory_period_us,
            cfg.flow.dt_max_us,
            cfg.flow.dx,
            cfg.flow.n_min,
            cfg.flow.n_reject,
            cfg.flow.max_nrmse,
            cfg.flow.v_max,
        );
        Some(open_flow_csv(&cli.flow_csv, &params_line)?)
    } else {
        None
    };
    let sink_cfg = SinkConfig {
        mode,
        ..Default::default()
    };
    let sink = SinkWorker::new(&sink_cfg, rx, serial, csv_file).spawn()?;

    let events = match &cli.input {
        Some(path) => {
            let rdr = AedatReader::open(path, size)
                .with_context(|| format!("opening AEDAT input {}", path.display()))?;
            info!("replaying {} ({:?})", path.display(), rdr.variant());
            rdr.collect::<Result<Vec<_>, _>>()?
        }
        None => {
            info!("no input given, generating a synthetic moving-edge stimulus");
            synthetic_moving_edge(size)
        }
    };

    let packet_size = cli.packet_size.max(1);
    for packet in events.chunks(packet_size) {
        pipeline.process_packet(packet);
    }

    let stats = pipeline.finish()?;
    let sink_stats = sink.stop_and_join()?;
    info!(
        "done: {} events, {} flow vectors ({} queued drops), {} CSV rows, {} serial frames",
        stats.events_in,
        stats.flows_accepted,
        stats.ring_full_drops,
        sink_stats.csv_lines,
        sink_stats.frames_sent,
    );
    Ok(())
}

/// A vertical edge sweeping across the full sensor at 100 px/s, ON events
/// on the leading edge and OFF events one column behind.
fn synthetic_moving_edge(size: SensorSize) -> Vec<PolarityEvent> {
    let mut events = Vec::new();
    let t0 = 1_000_000i64;
    for x in 1..size.width.saturating_sub(1) {
        let t = t0 + 10_000 * x as i64;
        for y in 1..size.height.saturating_sub(1) {
            events.push(PolarityEvent {
                x,
                y,
                timestamp: t,
                polarity: Polarity::On,
            });
            if x > 1 {
                events.push(PolarityEvent {
                    x: x - 1,
                    y,
                    timestamp: t,
                    polarity: Polarity::Off,
                });
            }
        }
    }
    events
}
