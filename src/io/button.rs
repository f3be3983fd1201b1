//! Validation-button seam.
//!
//! The physical button sits on GPIO; where no hardware is present the
//! node falls back to a simulated button driven from the console. A press
//! only counts once it has been held for the debounce window.

use std::sync::Mutex;
use std::time::Instant;

/// Sustained-press window for a long press to register.
pub const LONG_PRESS_SEC: f64 = 0.5;

/// Polled button state.
pub trait Button: Send + Sync {
    /// Whether the input is active right now.
    fn is_pressed_now(&self) -> bool;

    /// Whether the input has been continuously active for at least the
    /// debounce window.
    fn has_been_pressed_long_enough(&self) -> bool;

    /// Forget the current press (called after a press is consumed).
    fn reset(&self);

    /// Make the next two polls report a qualifying long press (testing
    /// and the `button` command).
    fn simulate_long_press(&self);
}

#[derive(Debug, Default)]
struct SimulatedState {
    pressed_since: Option<Instant>,
    simulated: bool,
}

/// Software button: either driven by [`press`](SimulatedButton::press) /
/// [`release`](SimulatedButton::release), or pulsed by
/// `simulate_long_press`.
#[derive(Debug, Default)]
pub struct SimulatedButton {
    state: Mutex<SimulatedState>,
}

impl SimulatedButton {
    /// New, unpressed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin holding the button.
    pub fn press(&self) {
        let mut state = self.state.lock().unwrap();
        if state.pressed_since.is_none() {
            state.pressed_since = Some(Instant::now());
        }
    }

    /// Release the button.
    pub fn release(&self) {
        self.state.lock().unwrap().pressed_since = None;
    }
}

impl Button for SimulatedButton {
    fn is_pressed_now(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.simulated || state.pressed_since.is_some()
    }

    fn has_been_pressed_long_enough(&self) -> bool {
        let state = self.state.lock().unwrap();
        if state.simulated {
            return true;
        }
        match state.pressed_since {
            Some(since) => since.elapsed().as_secs_f64() >= LONG_PRESS_SEC,
            None => false,
        }
    }

    fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.simulated = false;
        state.pressed_since = None;
    }

    fn simulate_long_press(&self) {
        self.state.lock().unwrap().simulated = true;
    }
}
