//! Teleop Recorder - leader/follower arm teleoperation with synchronized
//! two-camera episode recording.
//!
//! The library provides the mirroring loop, the synchronized sampler, the
//! episode container and the session controller. Hardware is reached only
//! through the traits in [`capture`].

pub mod capture;
pub mod commands;
pub mod episode;
pub mod recorder;
pub mod utils;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "teleop_recorder=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
