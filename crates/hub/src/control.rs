//! Operator control surface: marker files that halt or pause actuation.
//! Setting and clearing them is done outside the hub.

use serde::Serialize;

use crate::config::ControlConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ControlFlags {
    pub emergency_stop: bool,
    pub paused: bool,
}

impl ControlFlags {
    /// Checked fresh on every cycle and every manual request.
    pub fn read(cfg: &ControlConfig) -> Self {
        Self {
            emergency_stop: cfg.emergency_stop_file.exists(),
            paused: cfg.pause_file.exists(),
        }
    }

    pub fn halted(&self) -> bool {
        self.emergency_stop || self.paused
    }
}
