//! Operator CLI for the probing stage.
//!
//! Each subcommand opens the configured serial port, initializes the axes
//! it needs, performs the operation, and prints the result. `watch` only
//! attaches to the shared snapshot region and needs no serial access.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use probe_stage::{
    AxisId, HomeDirection, SnapshotReader, StageConfiguration, StageManager,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stage_ctl", about = "Probing stage motion control")]
struct Cli {
    /// Stage configuration file.
    #[arg(long, default_value = "stage.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect the listed axes and report their positions.
    Init {
        /// Axes to bring up (x, y, z, fr, cr); all configured axes if empty.
        axes: Vec<String>,
    },
    /// Home an axis to a limit switch.
    Home {
        axis: String,
        /// Home to the positive limit instead of the negative one.
        #[arg(long)]
        positive: bool,
        /// Survey both limits and rewrite the soft limits.
        #[arg(long)]
        limits: bool,
    },
    /// Move an axis (microns or degrees).
    Move {
        axis: String,
        position: f64,
        #[arg(long)]
        relative: bool,
    },
    /// Read fresh positions for every configured axis.
    Position,
    /// Print the aggregate stage status.
    Status,
    /// Follow the shared snapshot region published by another process.
    Watch {
        #[arg(long, default_value_t = 1.0)]
        interval_secs: f64,
    },
}

fn parse_axis(raw: &str) -> Result<AxisId> {
    raw.parse::<AxisId>().map_err(anyhow::Error::from)
}

async fn open_stage(config: StageConfiguration, axes: &[AxisId]) -> Result<StageManager> {
    let stage = StageManager::connect(config).context("failed to open serial port")?;
    stage
        .initialize(axes)
        .await
        .context("axis initialization failed")?;
    stage.enable_snapshot_publishing().await?;
    Ok(stage)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = StageConfiguration::load(&cli.config)?;

    match cli.command {
        Command::Init { axes } => {
            let axes: Vec<AxisId> = if axes.is_empty() {
                config.axes.keys().copied().collect()
            } else {
                axes.iter()
                    .map(|raw| parse_axis(raw))
                    .collect::<Result<_>>()?
            };
            let stage = open_stage(config, &axes).await?;
            for (axis, position) in stage.get_all_positions().await {
                println!("{axis}: {position:.3} {}", axis.units());
            }
            stage.disconnect_all().await;
        }
        Command::Home {
            axis,
            positive,
            limits,
        } => {
            let axis = parse_axis(&axis)?;
            // Z limit surveys park Y first, so bring Y up alongside Z.
            let axes = if limits && axis == AxisId::Z {
                vec![AxisId::Y, AxisId::Z]
            } else {
                vec![axis]
            };
            let stage = open_stage(config, &axes).await?;
            if limits {
                let (lo, hi) = stage.home_to_limits(axis).await?;
                println!("{axis}: travel [{lo:.3}, {hi:.3}] {}", axis.units());
            } else {
                let direction = if positive {
                    HomeDirection::Positive
                } else {
                    HomeDirection::Negative
                };
                stage.home_axis(axis, direction).await?;
                println!("{axis}: homed");
            }
            stage.disconnect_all().await;
        }
        Command::Move {
            axis,
            position,
            relative,
        } => {
            let axis = parse_axis(&axis)?;
            let stage = open_stage(config, &[axis]).await?;
            let ok = stage
                .move_single_axis(axis, position, relative, None, true)
                .await?;
            let landed = stage.get_position(axis).await?;
            println!(
                "{axis}: {} at {:.3} {}",
                if ok { "completed" } else { "out of tolerance" },
                landed.actual,
                landed.units
            );
            stage.disconnect_all().await;
        }
        Command::Position => {
            let axes: Vec<AxisId> = config.axes.keys().copied().collect();
            let stage = open_stage(config, &axes).await?;
            for (axis, position) in stage.get_all_positions().await {
                println!("{axis}: {position:.3} {}", axis.units());
            }
            stage.disconnect_all().await;
        }
        Command::Status => {
            let axes: Vec<AxisId> = config.axes.keys().copied().collect();
            let stage = open_stage(config, &axes).await?;
            let status = stage.get_status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
            stage.disconnect_all().await;
        }
        Command::Watch { interval_secs } => {
            let reader = SnapshotReader::attach(&config.snapshot_region)
                .context("no snapshot region; is a stage session running?")?;
            loop {
                match reader.read() {
                    Ok(snapshot) => {
                        print!("{} |", snapshot.captured_at.format("%H:%M:%S%.3f"));
                        for (axis, state) in &snapshot.axes {
                            print!(
                                " {axis}={:.1}{}{}",
                                state.runtime.position,
                                state.units,
                                if state.runtime.move_in_progress { "*" } else { "" }
                            );
                        }
                        println!();
                    }
                    Err(e) => println!("snapshot unavailable: {e}"),
                }
                tokio::time::sleep(Duration::from_secs_f64(interval_secs)).await;
            }
        }
    }

    Ok(())
}
