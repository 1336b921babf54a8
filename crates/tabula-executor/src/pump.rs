//! Update pump: coalesces change notifications into single-flight passes.
//!
//! ```text
//!            notify                    notify
//!   Idle ───────────▶ Running ───────────────▶ RunningWithRetrigger
//!    ▲                  │  ▲                          │
//!    └──finish_pass─────┘  └───────finish_pass────────┘
//! ```
//!
//! Any number of notifications during a pass collapse into one more pass.

use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PumpState {
    Idle,
    Running,
    RunningWithRetrigger,
}

#[derive(Debug)]
pub struct UpdatePump {
    state: Mutex<PumpState>,
    wake: Notify,
}

impl UpdatePump {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PumpState::Idle),
            wake: Notify::new(),
        }
    }

    pub fn state(&self) -> PumpState {
        *self.state.lock().expect("pump lock")
    }

    /// Request a pass. Never blocks.
    pub fn notify(&self) {
        let mut state = self.state.lock().expect("pump lock");
        match *state {
            PumpState::Idle => {
                *state = PumpState::Running;
                self.wake.notify_one();
            }
            PumpState::Running => *state = PumpState::RunningWithRetrigger,
            PumpState::RunningWithRetrigger => {}
        }
    }

    /// Wait until a pass has been requested.
    pub async fn wait_for_work(&self) {
        loop {
            let woken = self.wake.notified();
            if self.state() != PumpState::Idle {
                return;
            }
            woken.await;
        }
    }

    /// Mark the current pass finished. Returns true if another pass was
    /// requested while it ran; the pump stays running in that case.
    pub fn finish_pass(&self) -> bool {
        let mut state = self.state.lock().expect("pump lock");
        match *state {
            PumpState::RunningWithRetrigger => {
                *state = PumpState::Running;
                true
            }
            PumpState::Running | PumpState::Idle => {
                *state = PumpState::Idle;
                false
            }
        }
    }
}

impl Default for UpdatePump {
    fn default() -> Self {
        Self::new()
    }
}
