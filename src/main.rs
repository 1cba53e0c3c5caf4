use anyhow::Context;
use clap::Parser;
use std::f64::consts::TAU;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use teleop_recorder::capture::sim::{simulated_hardware, SimulatedRig};
use teleop_recorder::capture::ArmId;
use teleop_recorder::episode::JointPosition;
use teleop_recorder::recorder::{SessionController, SessionConfig, SessionEvent};
use teleop_recorder::utils::MonotonicClock;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "teleop-recorder")]
#[command(about = "Leader/follower teleoperation with synchronized episode recording", long_about = None)]
struct Args {
    /// JSON session configuration
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the episode output directory
    #[arg(short, long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Record positions in radians instead of raw ticks
    #[arg(long, default_value_t = false)]
    radians: bool,
}

/// Moves the simulated leader along a slow sweep, standing in for the operator
fn sweep_leader(rig: SimulatedRig, running: Arc<AtomicBool>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let start = Instant::now();
        while running.load(Ordering::Relaxed) {
            let t = start.elapsed().as_secs_f64();
            let mut values = [2048.0; 6];
            for (i, value) in values.iter_mut().enumerate() {
                let phase = i as f64 * 0.7;
                *value += 600.0 * (TAU * 0.2 * t + phase).sin();
            }
            rig.set_position(ArmId::Leader, JointPosition::new(values));
            std::thread::sleep(Duration::from_millis(10));
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    teleop_recorder::init_tracing();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }
    if args.radians {
        config.position_unit = teleop_recorder::episode::PositionUnit::Radians;
    }

    tracing::info!("Starting Teleop Recorder v{}", env!("CARGO_PKG_VERSION"));

    let clock = MonotonicClock::shared();
    let (hardware, rig, _cameras) = simulated_hardware(&config, clock.clone());
    let controller = SessionController::new(config, hardware, clock)?;
    let mut events = controller.subscribe();
    let (handle, controller_task) = controller.spawn();

    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::EpisodeSaved { episode_num, path } => {
                    println!("Saved episode {episode_num} to {}", path.display());
                }
                SessionEvent::WriteFailed { episode_num, error, .. } => {
                    println!("Episode {episode_num} was not saved: {}", error.message);
                }
                other => tracing::debug!("Session event: {:?}", other),
            }
        }
    });

    let sweeping = Arc::new(AtomicBool::new(true));
    let sweeper = sweep_leader(rig, sweeping.clone());

    handle
        .start_session()
        .await
        .map_err(|e| anyhow::anyhow!("{}: {}", e.code, e.message))?;

    println!("Commands: s = start recording, x = stop and save, q = quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let reply = match line.trim() {
            "s" => handle.start_recording().await,
            "x" => handle.stop_recording().await,
            "q" => break,
            "" => continue,
            other => {
                println!("Unknown command {other:?}");
                continue;
            }
        };
        match reply {
            Ok(outcome) if !outcome.is_applied() => println!("Ignored: {:?}", outcome),
            Ok(_) => {}
            Err(e) => println!("Error: {}", e.message),
        }
    }

    if let Err(e) = handle.shutdown().await {
        tracing::warn!("Shutdown reported: {}", e.message);
    }
    controller_task.await?;

    sweeping.store(false, Ordering::Relaxed);
    let _ = sweeper.join();
    Ok(())
}
