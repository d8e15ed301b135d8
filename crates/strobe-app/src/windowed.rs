// SPDX-License-Identifier: CEPL-1.0
//! Windowed frame loop on the Vulkan backend: clear, present, repeat.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use strobe_core::Clock;
use strobe_platform::has_area;
use strobe_platform::winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowId},
};
use strobe_present::{RenderSize, Swapchain};
use strobe_present_vk::VkBackend;
use tracing::{error, info};

use crate::config::StrobeConfig;

#[cfg(unix)]
fn host_clock() -> Arc<dyn Clock> {
    // Display timing reports are on CLOCK_MONOTONIC.
    Arc::new(strobe_core::MonotonicClock)
}

#[cfg(not(unix))]
fn host_clock() -> Arc<dyn Clock> {
    Arc::new(strobe_core::SystemClock::new())
}

struct App {
    cfg: StrobeConfig,
    sync_interval: u32,
    max_frames: Option<u64>,

    window: Option<Arc<Window>>,
    swapchain: Option<Swapchain<VkBackend>>,
    paused: bool,

    frames: u64,
    fps_frames: u32,
    last_fps_instant: Instant,
    fatal: Option<anyhow::Error>,
}

impl App {
    fn start(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window = Arc::new(
            event_loop
                .create_window(Window::default_attributes().with_title("strobe"))
                .context("create_window")?,
        );
        let size = window.inner_size();
        let backend = VkBackend::new(window.clone()).context("vulkan init")?;
        let swapchain = Swapchain::new(
            backend,
            RenderSize {
                width: size.width.max(1),
                height: size.height.max(1),
            },
            self.sync_interval,
            &self.cfg.present,
            host_clock(),
        )?;
        info!(
            "vk: pacing {:?}, {} buffers, sync interval {}",
            swapchain.pacing_mode(),
            swapchain.buffer_count(),
            self.sync_interval
        );
        self.paused = !has_area(size);
        self.window = Some(window);
        self.swapchain = Some(swapchain);
        Ok(())
    }

    fn draw_frame(&mut self) -> Result<()> {
        let Some(sc) = self.swapchain.as_mut() else {
            return Ok(());
        };
        let lease = sc.acquire_back_buffer()?;
        let commands = sc.begin_commands()?;
        sc.prepare_for_rendering(commands);
        sc.backend_mut()
            .record_clear(commands, lease.image_index, self.cfg.app.clear_color);
        sc.present(commands, self.sync_interval)?;
        self.frames += 1;
        self.fps_frames = self.fps_frames.saturating_add(1);
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, e: anyhow::Error) {
        self.fatal = Some(e);
        self.shutdown(event_loop);
    }

    fn shutdown(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(mut sc) = self.swapchain.take() {
            sc.destroy();
        }
        self.window = None;
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            if let Err(e) = self.start(event_loop) {
                self.fail(event_loop, e);
                return;
            }
        }
        if !self.paused {
            if let Some(w) = &self.window {
                w.request_redraw();
            }
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.shutdown(event_loop);
            }

            WindowEvent::Resized(new_size) => {
                let now_paused = !has_area(new_size);
                if self.paused != now_paused {
                    self.paused = now_paused;
                    info!(
                        "Resized → {}x{} (paused={})",
                        new_size.width, new_size.height, self.paused
                    );
                }
                if self.paused {
                    return;
                }
                let size = RenderSize {
                    width: new_size.width,
                    height: new_size.height,
                };
                let resized = match self.swapchain.as_mut() {
                    Some(sc) if sc.extent() != Some(size) => sc.resize(size),
                    _ => Ok(()),
                };
                if let Err(e) = resized {
                    self.fail(event_loop, e.into());
                    return;
                }
                if let Some(w) = &self.window {
                    w.request_redraw();
                }
            }

            WindowEvent::Occluded(occluded) => {
                let has_size = self
                    .window
                    .as_ref()
                    .is_some_and(|w| has_area(w.inner_size()));
                self.paused = occluded || !has_size;
                info!("Occluded={} → paused={}", occluded, self.paused);
            }

            WindowEvent::RedrawRequested => {
                if self.paused {
                    return;
                }
                if let Err(e) = self.draw_frame() {
                    self.fail(event_loop, e);
                    return;
                }
                if self.max_frames.is_some_and(|max| self.frames >= max) {
                    info!("rendered {} frames, exiting", self.frames);
                    self.shutdown(event_loop);
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            return;
        }
        if self.paused {
            event_loop.set_control_flow(ControlFlow::Wait);
            self.fps_frames = 0;
            return;
        }
        // The swapchain paces presents itself; keep asking for frames.
        event_loop.set_control_flow(ControlFlow::Poll);
        if let Some(w) = &self.window {
            w.request_redraw();
        }

        let now = Instant::now();
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            let rebuilds = self.swapchain.as_ref().map_or(0, |sc| sc.rebuilds());
            info!("fps ~ {} (rebuilds {})", self.fps_frames, rebuilds);
            self.fps_frames = 0;
            self.last_fps_instant = now;
        }
    }
}

pub fn run(cfg: StrobeConfig, max_frames: Option<u64>, sync_interval: u32) -> Result<()> {
    let event_loop: EventLoop<()> = EventLoop::new()?;
    let mut app = App {
        cfg,
        sync_interval,
        max_frames,
        window: None,
        swapchain: None,
        paused: false,
        frames: 0,
        fps_frames: 0,
        last_fps_instant: Instant::now(),
        fatal: None,
    };
    event_loop.run_app(&mut app)?;
    match app.fatal.take() {
        Some(e) => {
            error!("presentation failed after {} frames", app.frames);
            Err(e)
        }
        None => Ok(()),
    }
}
