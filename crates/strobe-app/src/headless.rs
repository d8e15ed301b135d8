// SPDX-License-Identifier: CEPL-1.0
//! Frame loop against the simulated backend. Time is simulated too, so a
//! run finishes immediately regardless of the pacing it exercises.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use strobe_core::ManualClock;
use strobe_present::sim::SimBackend;
use strobe_present::{RenderSize, Swapchain};
use tracing::{info, warn};

use crate::config::StrobeConfig;

const SIM_SIZE: RenderSize = RenderSize {
    width: 1280,
    height: 720,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub presents: u64,
    pub rebuilds: u64,
    pub acquires: u64,
    pub suboptimal_acquires: u64,
    pub set_creations: u64,
    pub simulated: Duration,
}

pub fn run(cfg: &StrobeConfig, frames: u64, sync_interval: u32) -> Result<RunSummary> {
    let clock = ManualClock::new();
    let sim = SimBackend::new(cfg.sim.backend.clone(), clock.clone());
    let stats = sim.stats();
    let mut swapchain = Swapchain::new(
        sim,
        SIM_SIZE,
        sync_interval,
        &cfg.present,
        Arc::new(clock.clone()),
    )?;
    info!(
        "sim: {} frames, pacing {:?}, {} buffers",
        frames,
        swapchain.pacing_mode(),
        swapchain.buffer_count()
    );

    let frame_cost = Duration::from_secs_f64(cfg.sim.frame_cost_ms.max(0.0) / 1000.0);
    for frame in 0..frames {
        for plan in cfg.sim.faults.iter().filter(|p| p.frame == frame) {
            info!("frame {frame}: injecting {:?} at {:?}", plan.status, plan.site);
            swapchain.backend_mut().inject(plan.site, plan.fault());
        }
        swapchain.acquire_back_buffer()?;
        let commands = swapchain.begin_commands()?;
        swapchain.prepare_for_rendering(commands);
        clock.advance(frame_cost);
        swapchain.present(commands, sync_interval)?;
    }

    let violations = swapchain.backend().violations().to_vec();
    let summary = RunSummary {
        presents: swapchain.presents_completed(),
        rebuilds: swapchain.rebuilds(),
        acquires: swapchain.acquires(),
        suboptimal_acquires: swapchain.suboptimal_acquires(),
        set_creations: stats.set_creations(),
        simulated: Duration::from_nanos(clock.nanos()),
    };
    swapchain.destroy();

    if !violations.is_empty() {
        for v in &violations {
            warn!("sim violation: {v}");
        }
        bail!("{} usage violations during the run", violations.len());
    }
    info!(
        "sim done: {} presents, {} acquires ({} suboptimal), {} rebuilds, {} set creations, {:.3}s simulated",
        summary.presents,
        summary.acquires,
        summary.suboptimal_acquires,
        summary.rebuilds,
        summary.set_creations,
        summary.simulated.as_secs_f64()
    );
    Ok(summary)
}
