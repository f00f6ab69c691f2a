use crate::input::{ButtonMapper, ButtonStates, InputAction};

// Outcome of one loop iteration.
pub enum Step {
    Continue(Option<InputAction>),
    Quit,
}

// Frame counter plus input bookkeeping for the main loop. The counter
// advances once per frame cycle, whether or not anything was rendered.
pub struct FrameLoop {
    frame_index: u64,
    mapper: ButtonMapper,
}

impl FrameLoop {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            frame_index: 0,
            mapper: ButtonMapper::new(),
        }
    }

    pub fn get_frame_index(&self) -> u64 {
        self.frame_index
    }

    // buttons_opt is None when input was not sampled this cycle (nothing was
    // rendered, or the controllers are not tracked). Edge state is left
    // untouched then, so a pending release still fires on the next sample.
    pub fn advance(&mut self, buttons_opt: Option<ButtonStates>) -> Step {
        self.frame_index += 1;

        let action_opt = buttons_opt.and_then(|buttons| self.mapper.update(&buttons));

        if matches!(action_opt, Some(InputAction::Quit)) {
            return Step::Quit;
        }

        Step::Continue(action_opt)
    }
}
