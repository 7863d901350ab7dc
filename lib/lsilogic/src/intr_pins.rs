// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![allow(clippy::mutex_atomic)]

use std::sync::Mutex;

pub trait IntrPin: Send + Sync + 'static {
    fn assert(&self);
    fn deassert(&self);
    fn is_asserted(&self) -> bool;
    fn pulse(&self) {
        if !self.is_asserted() {
            self.assert();
            self.deassert();
        }
    }
    fn set_state(&self, is_asserted: bool) {
        if is_asserted {
            self.assert();
        } else {
            self.deassert();
        }
    }
}

/// A level-triggered interrupt line, standing in for the INTx pin routed by
/// the hosting PCI emulation.
///
/// Transitions are forwarded to an optional sink so the host can relay them
/// to its interrupt controller.
pub struct LevelPin {
    inner: Mutex<PinState>,
    sink: Option<Box<dyn Fn(bool) + Send + Sync>>,
}

#[derive(Default)]
struct PinState {
    asserted: bool,
    rising: usize,
}

impl LevelPin {
    pub fn new() -> Self {
        Self { inner: Mutex::new(PinState::default()), sink: None }
    }

    /// Create a pin which calls `sink` on every level transition.
    pub fn with_sink(sink: impl Fn(bool) + Send + Sync + 'static) -> Self {
        Self {
            inner: Mutex::new(PinState::default()),
            sink: Some(Box::new(sink)),
        }
    }

    /// Number of 0->1 transitions observed on this pin.
    pub fn assert_count(&self) -> usize {
        self.inner.lock().unwrap().rising
    }

    fn transition(&self, level: bool) {
        let mut inner = self.inner.lock().unwrap();
        if inner.asserted == level {
            return;
        }
        inner.asserted = level;
        if level {
            inner.rising += 1;
        }
        if let Some(sink) = self.sink.as_ref() {
            sink(level);
        }
    }
}
impl Default for LevelPin {
    fn default() -> Self {
        Self::new()
    }
}

impl IntrPin for LevelPin {
    fn assert(&self) {
        self.transition(true);
    }
    fn deassert(&self) {
        self.transition(false);
    }
    fn is_asserted(&self) -> bool {
        self.inner.lock().unwrap().asserted
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn level_transitions() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_sink = seen.clone();
        let pin = LevelPin::with_sink(move |_| {
            seen_sink.fetch_add(1, Ordering::Relaxed);
        });

        pin.assert();
        pin.assert();
        assert!(pin.is_asserted());
        pin.set_state(false);
        assert!(!pin.is_asserted());
        pin.pulse();

        assert_eq!(pin.assert_count(), 2);
        // assert, deassert, and the two edges of the pulse
        assert_eq!(seen.load(Ordering::Relaxed), 4);
    }
}
