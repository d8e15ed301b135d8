// SPDX-License-Identifier: CEPL-1.0
use std::fs;
use std::path::Path;

use serde::Deserialize;
use strobe_present::backend::BackendStatus;
use strobe_present::sim::{Fault, FaultSite, SimConfig};
use strobe_present::PresentConfig;
use tracing::{info, warn};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StrobeConfig {
    pub app: AppCfg,
    pub present: PresentConfig,
    pub sim: SimCfg,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppCfg {
    pub clear_color: [f32; 4],
    pub sync_interval: u32,
    /// Frames rendered by the headless run.
    pub frames: u64,
}

impl Default for AppCfg {
    fn default() -> Self {
        Self {
            clear_color: [0.02, 0.02, 0.04, 1.0],
            sync_interval: 1,
            frames: 600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimCfg {
    #[serde(flatten)]
    pub backend: SimConfig,
    /// Simulated CPU cost of recording one frame.
    pub frame_cost_ms: f64,
    pub faults: Vec<FaultPlan>,
}

impl Default for SimCfg {
    fn default() -> Self {
        Self {
            backend: SimConfig::default(),
            frame_cost_ms: 4.0,
            faults: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultStatus {
    OutOfDate,
    SurfaceLost,
    Suboptimal,
    DeviceLost,
}

impl From<FaultStatus> for BackendStatus {
    fn from(s: FaultStatus) -> Self {
        match s {
            FaultStatus::OutOfDate => BackendStatus::OutOfDate,
            FaultStatus::SurfaceLost => BackendStatus::SurfaceLost,
            FaultStatus::Suboptimal => BackendStatus::Suboptimal,
            FaultStatus::DeviceLost => BackendStatus::DeviceLost,
        }
    }
}

/// One injected failure, armed right before frame `frame` acquires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct FaultPlan {
    pub frame: u64,
    pub site: FaultSite,
    pub status: FaultStatus,
    #[serde(default)]
    pub persistent: bool,
}

impl FaultPlan {
    pub fn fault(&self) -> Fault {
        if self.persistent {
            Fault::Persistent(self.status.into())
        } else {
            Fault::Once(self.status.into())
        }
    }
}

pub fn load(path: &Path) -> StrobeConfig {
    let text = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(_) => {
            info!("{} not found, using defaults", path.display());
            return StrobeConfig::default();
        }
    };
    match toml::from_str::<StrobeConfig>(&text) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!("{} is invalid ({e}), using defaults", path.display());
            StrobeConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strobe_present::config::PacingPreference;

    #[test]
    fn sections_parse_with_defaults_filled_in() {
        let cfg: StrobeConfig = toml::from_str(
            r#"
            [app]
            sync_interval = 2

            [present]
            pacing = "reactive"

            [sim]
            max_image_count = 3
            present_timing = true

            [[sim.faults]]
            frame = 5
            site = "acquire"
            status = "out_of_date"

            [[sim.faults]]
            frame = 9
            site = "present"
            status = "surface_lost"
            persistent = true
            "#,
        )
        .unwrap();

        assert_eq!(cfg.app.sync_interval, 2);
        assert_eq!(cfg.app.frames, 600);
        assert_eq!(cfg.present.pacing, PacingPreference::Reactive);
        assert_eq!(cfg.present.desired_buffer_count, 3);
        assert_eq!(cfg.sim.backend.max_image_count, 3);
        assert_eq!(cfg.sim.backend.min_image_count, 2);
        assert!(cfg.sim.backend.present_timing);
        assert_eq!(cfg.sim.faults.len(), 2);
        assert_eq!(
            cfg.sim.faults[0].fault(),
            Fault::Once(BackendStatus::OutOfDate)
        );
        assert_eq!(
            cfg.sim.faults[1].fault(),
            Fault::Persistent(BackendStatus::SurfaceLost)
        );
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = load(Path::new("/nonexistent/strobe.toml"));
        assert_eq!(cfg.app.sync_interval, 1);
        assert!(cfg.sim.faults.is_empty());
    }
}
