use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;

use crossterm::event::{self, Event as CtEvent, KeyEvent};
use tracing::debug;

/// Unified event type consumed by the app runner
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InputEvent {
    Key(KeyEvent),
    Resize,
    /// Terminal window lost focus; the admin session ends.
    FocusLost,
    FocusGained,
    Tick,
}

/// Source of terminal events (keyboard, resize, focus)
pub trait InputSource: Send + 'static {
    /// Block for up to `timeout` waiting for an event.
    /// Returns Ok(event) if an event arrives before the timeout, or Err(Timeout) if it expires.
    fn recv_timeout(&self, timeout: Duration) -> Result<InputEvent, RecvTimeoutError>;
}

/// Production event source using crossterm
pub struct CrosstermInputSource {
    rx: Receiver<InputEvent>,
}

impl CrosstermInputSource {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();

        std::thread::spawn(move || loop {
            let forwarded = match event::read() {
                Ok(CtEvent::Key(key)) => Some(InputEvent::Key(key)),
                Ok(CtEvent::Resize(_, _)) => Some(InputEvent::Resize),
                Ok(CtEvent::FocusLost) => Some(InputEvent::FocusLost),
                Ok(CtEvent::FocusGained) => Some(InputEvent::FocusGained),
                Ok(_) => None,
                Err(err) => {
                    debug!(%err, "terminal event reader stopped");
                    break;
                }
            };
            if let Some(ev) = forwarded {
                if tx.send(ev).is_err() {
                    break;
                }
            }
        });

        Self { rx }
    }
}

impl Default for CrosstermInputSource {
    fn default() -> Self {
        Self::new()
    }
}

impl InputSource for CrosstermInputSource {
    fn recv_timeout(&self, timeout: Duration) -> Result<InputEvent, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }
}

/// Configurable ticker interface
pub trait Ticker: Send + Sync + 'static {
    fn interval(&self) -> Duration;
}

/// Fixed interval ticker
#[derive(Clone, Copy, Debug)]
pub struct FixedTicker {
    interval: Duration,
}

impl FixedTicker {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Ticker for FixedTicker {
    fn interval(&self) -> Duration {
        self.interval
    }
}

/// Channel-fed event source for headless runs
pub struct TestInputSource {
    rx: Receiver<InputEvent>,
}

impl TestInputSource {
    pub fn new(rx: Receiver<InputEvent>) -> Self {
        Self { rx }
    }
}

impl InputSource for TestInputSource {
    fn recv_timeout(&self, timeout: Duration) -> Result<InputEvent, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }
}

/// Runner that advances the application one event/tick at a time
pub struct Runner<E: InputSource, T: Ticker> {
    input: E,
    ticker: T,
}

impl<E: InputSource, T: Ticker> Runner<E, T> {
    pub fn new(input: E, ticker: T) -> Self {
        Self { input, ticker }
    }

    /// Blocks up to tick interval and returns the next event, or Tick on timeout
    pub fn step(&self) -> InputEvent {
        match self.input.recv_timeout(self.ticker.interval()) {
            Ok(ev) => ev,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => InputEvent::Tick,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn step_returns_tick_on_timeout() {
        let (_tx, rx) = mpsc::channel();
        let runner = Runner::new(TestInputSource::new(rx), FixedTicker::new(Duration::from_millis(1)));

        assert_eq!(runner.step(), InputEvent::Tick);
    }

    #[test]
    fn step_passes_through_events() {
        let (tx, rx) = mpsc::channel();
        tx.send(InputEvent::Resize).unwrap();
        tx.send(InputEvent::FocusLost).unwrap();
        let runner = Runner::new(TestInputSource::new(rx), FixedTicker::new(Duration::from_millis(10)));

        assert_eq!(runner.step(), InputEvent::Resize);
        assert_eq!(runner.step(), InputEvent::FocusLost);
    }

    #[test]
    fn disconnected_source_ticks() {
        let (tx, rx) = mpsc::channel::<InputEvent>();
        drop(tx);
        let runner = Runner::new(TestInputSource::new(rx), FixedTicker::new(Duration::from_millis(1)));
        assert_eq!(runner.step(), InputEvent::Tick);
    }
}
