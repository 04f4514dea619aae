use clap::Parser;
use tracing_subscriber::EnvFilter;

use ct_phase_recon::{config, train};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    if cfg!(debug_assertions) {
        tracing::warn!(
            "running a debug build. Training can be much slower. Use `cargo run --release ...`."
        );
    }
    let cfg = config::TrainConfig::parse();
    train::run_training(&cfg)
}
