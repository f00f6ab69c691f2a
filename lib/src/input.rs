// Controller button handling. The runtime hands us one digital snapshot per
// frame cycle, edge detection and the action mapping live here.

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TouchButton {
    A,
    B,
    X,
    Y,
}

// Snapshot of the four face buttons, taken once per frame cycle.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ButtonStates {
    pub a: bool,
    pub b: bool,
    pub x: bool,
    pub y: bool,
}

impl ButtonStates {
    pub fn get(&self, button: TouchButton) -> bool {
        match button {
            TouchButton::A => self.a,
            TouchButton::B => self.b,
            TouchButton::X => self.x,
            TouchButton::Y => self.y,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Edge {
    Rising,
    Falling,
}

// Compares each sample against the previous one. The first sample sets the
// baseline without reporting an edge, so a button held at startup does not
// fire until it changes.
pub struct EdgeDetector {
    prev: Option<bool>,
}

impl EdgeDetector {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            prev: None,
        }
    }

    pub fn update(&mut self, state: bool) -> Option<Edge> {
        let edge = match self.prev {
            Some(false) if state => Some(Edge::Rising),
            Some(true) if !state => Some(Edge::Falling),
            _ => None,
        };

        self.prev = Some(state);
        edge
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InputAction {
    Recenter,
    Quit,
    SetHighQuality(bool),
}

fn map_action(button: TouchButton) -> InputAction {
    match button {
        TouchButton::A => InputAction::Recenter,
        TouchButton::B => InputAction::Quit,
        TouchButton::X => InputAction::SetHighQuality(false),
        TouchButton::Y => InputAction::SetHighQuality(true),
    }
}

// Turns button snapshots into actions. Actions trigger on the falling edge
// (release), and at most one fires per update: when several buttons are
// released in the same snapshot, the first one in A, B, X, Y order wins.
// All detectors still advance, so the losing edges are consumed.
pub struct ButtonMapper {
    detectors: [EdgeDetector; 4],
}

impl ButtonMapper {
    const ORDER: [TouchButton; 4] = [TouchButton::A, TouchButton::B, TouchButton::X, TouchButton::Y];

    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            detectors: [EdgeDetector::new(), EdgeDetector::new(), EdgeDetector::new(), EdgeDetector::new()],
        }
    }

    pub fn update(&mut self, states: &ButtonStates) -> Option<InputAction> {
        let mut action_opt = None;

        for (button, detector) in Self::ORDER.iter().zip(self.detectors.iter_mut()) {
            let edge_opt = detector.update(states.get(*button));

            if action_opt.is_none() && matches!(edge_opt, Some(Edge::Falling)) {
                action_opt = Some(map_action(*button));
            }
        }

        action_opt
    }
}
