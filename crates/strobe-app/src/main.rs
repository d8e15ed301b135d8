// SPDX-License-Identifier: CEPL-1.0
mod config;
mod headless;
mod windowed;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use strobe_core::init_tracing;
use tracing::{error, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum BackendChoice {
    /// Window + Vulkan swapchain
    Vk,
    /// Headless run on the simulated backend
    Sim,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Presentation backend
    #[arg(long, value_enum, default_value_t = BackendChoice::Vk)]
    backend: BackendChoice,
    /// Frames to render before exiting (sim defaults to `app.frames`, vk runs until closed)
    #[arg(long)]
    frames: Option<u64>,
    #[arg(long, default_value = "strobe.toml")]
    config: PathBuf,
    /// Overrides `app.sync_interval`; 0 disables vsync
    #[arg(long)]
    sync_interval: Option<u32>,
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let cfg = config::load(&args.config);
    let sync_interval = args.sync_interval.unwrap_or(cfg.app.sync_interval);
    info!("backend = {:?}, sync interval = {}", args.backend, sync_interval);

    let outcome = match args.backend {
        BackendChoice::Sim => {
            let frames = args.frames.unwrap_or(cfg.app.frames);
            headless::run(&cfg, frames, sync_interval).map(|_| ())
        }
        BackendChoice::Vk => windowed::run(cfg, args.frames, sync_interval),
    };
    if let Err(e) = outcome {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
