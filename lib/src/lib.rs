// TODO: run rustfmt
use std::rc::Rc;

pub mod asset;

pub mod config;
use config::AppConfig;

pub mod frameloop;

pub mod imageset;
use imageset::ImageSet;

pub mod input;

pub mod output;
use output::{FrameTarget, OutputInfo};

mod render;
use render::Render;

pub mod util;
use util::PerfStats;

#[cfg(test)]
mod tests;

pub const APP_NAME: &str = env!("CARGO_PKG_DESCRIPTION");
pub const APP_VERSION_MAJOR: &str = env!("CARGO_PKG_VERSION_MAJOR");
pub const APP_VERSION_MINOR: &str = env!("CARGO_PKG_VERSION_MINOR");
pub const APP_VERSION_PATCH: &str = env!("CARGO_PKG_VERSION_PATCH");

pub struct Main {
    render: Render,
    perf: PerfStats,
}

impl Main {
    pub fn new(output_info: OutputInfo, images: ImageSet, config: &AppConfig) -> Self {
        let render = Render::new(Rc::new(output_info), images, config);

        Self {
            render,
            perf: PerfStats::new(config.perf_summary),
        }
    }

    pub fn render(&self, frame: &FrameTarget) {
        self.render.render(frame);
        self.perf.note_frame(self.render.get_render_time());
    }

    pub fn set_high_quality(&self, high_quality: bool) {
        log::info!("Render quality: {}", if high_quality { "high" } else { "low" });
        self.render.set_high_quality(high_quality);
    }
}
