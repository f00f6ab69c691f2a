use std::cell::Cell;
use std::time::Instant;

const SUMMARY_FRAMES: u32 = 100;

// Rolling frame statistics, logged instead of drawn. Everything runs on one
// thread, so plain Cells are enough here.
pub struct PerfStats {
    enabled: bool,
    frames: Cell<u64>,
    started: Instant,
    window_start: Cell<Instant>,
    window_frames: Cell<u32>,
}

impl PerfStats {
    pub fn new(enabled: bool) -> Self {
        let now = Instant::now();

        Self {
            enabled,
            frames: Cell::new(0),
            started: now,
            window_start: Cell::new(now),
            window_frames: Cell::new(0),
        }
    }

    // One call per rendered frame. render_time is the latest completed GPU
    // pass measurement in us, negative while a query is still in flight.
    pub fn note_frame(&self, render_time: i32) {
        if !self.enabled {
            return;
        }

        self.frames.set(self.frames.get() + 1);

        let window_frames = self.window_frames.get() + 1;
        if window_frames < SUMMARY_FRAMES {
            self.window_frames.set(window_frames);
            return;
        }

        let now = Instant::now();
        let elapsed = now.duration_since(self.window_start.get()).as_secs_f32();
        let fps = window_frames as f32 / elapsed;

        if render_time >= 0 {
            log::info!("Perf: {:.1} fps, gpu pass {} us", fps, render_time);
        } else {
            log::info!("Perf: {:.1} fps", fps);
        }

        self.window_start.set(now);
        self.window_frames.set(0);
    }
}

impl Drop for PerfStats {
    fn drop(&mut self) {
        let frames = self.frames.get();

        if self.enabled && frames > 0 {
            let elapsed = self.started.elapsed().as_secs_f32();
            log::info!("Rendered {} frames in {:.1} s ({:.1} fps)", frames, elapsed, frames as f32 / elapsed);
        }
    }
}
