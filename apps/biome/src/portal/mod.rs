//! Four-state portal lifecycle observed by the rest of the client.

use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

/// Delay between asking for shutdown and the portal reaching `Cold`.
pub const DEFAULT_TEARDOWN_DELAY: Duration = Duration::from_millis(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortalState {
    Cold,
    Warm,
    Hot,
    Streaming,
}

impl PortalState {
    fn rank(self) -> u8 {
        match self {
            PortalState::Cold => 0,
            PortalState::Warm => 1,
            PortalState::Hot => 2,
            PortalState::Streaming => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PortalState::Cold => "cold",
            PortalState::Warm => "warm",
            PortalState::Hot => "hot",
            PortalState::Streaming => "streaming",
        }
    }
}

impl fmt::Display for PortalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PortalError {
    #[error("portal cannot move from {from} back to {to}")]
    InvalidTransition { from: PortalState, to: PortalState },
}

/// Returned by [`PortalStateMachine::on_state_change`]; pass it to
/// [`PortalStateMachine::remove_listener`] to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

type Listener = Box<dyn FnMut(PortalState, PortalState) + Send>;

pub struct PortalStateMachine {
    state: PortalState,
    connected: bool,
    expanded: bool,
    teardown_delay: Duration,
    listeners: Vec<(ListenerHandle, Listener)>,
    next_handle: u64,
}

impl PortalStateMachine {
    pub fn new() -> Self {
        Self::with_teardown_delay(DEFAULT_TEARDOWN_DELAY)
    }

    pub fn with_teardown_delay(teardown_delay: Duration) -> Self {
        Self {
            state: PortalState::Cold,
            connected: false,
            expanded: false,
            teardown_delay,
            listeners: Vec::new(),
            next_handle: 0,
        }
    }

    pub fn state(&self) -> PortalState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_expanded(&self) -> bool {
        self.expanded
    }

    pub fn set_expanded(&mut self, expanded: bool) {
        self.expanded = expanded;
    }

    pub fn on_state_change<F>(&mut self, listener: F) -> ListenerHandle
    where
        F: FnMut(PortalState, PortalState) + Send + 'static,
    {
        self.next_handle += 1;
        let handle = ListenerHandle(self.next_handle);
        self.listeners.push((handle, Box::new(listener)));
        handle
    }

    pub fn remove_listener(&mut self, handle: ListenerHandle) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(existing, _)| *existing != handle);
        self.listeners.len() != before
    }

    /// Moves to `next` and notifies listeners with `(next, previous)`.
    ///
    /// Returns `Ok(false)` when already in `next`. Moving backwards is only
    /// allowed to `Cold`.
    pub fn transition_to(&mut self, next: PortalState) -> Result<bool, PortalError> {
        let previous = self.state;
        if previous == next {
            return Ok(false);
        }
        if next != PortalState::Cold && next.rank() < previous.rank() {
            return Err(PortalError::InvalidTransition {
                from: previous,
                to: next,
            });
        }

        match next {
            PortalState::Hot => self.connected = true,
            PortalState::Cold => {
                self.connected = false;
                self.expanded = false;
            }
            _ => {}
        }
        self.state = next;
        debug!(target: "biome::portal", from = %previous, to = %next, "portal transition");
        for (_, listener) in self.listeners.iter_mut() {
            listener(next, previous);
        }
        Ok(true)
    }

    /// Waits out the teardown delay, then settles in `Cold`.
    pub async fn shutdown(&mut self) {
        trace!(target: "biome::portal", delay_ms = self.teardown_delay.as_millis() as u64, "portal shutdown");
        tokio::time::sleep(self.teardown_delay).await;
        // Cold is reachable from every state.
        let _ = self.transition_to(PortalState::Cold);
        self.connected = false;
        self.expanded = false;
    }
}

impl Default for PortalStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PortalStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortalStateMachine")
            .field("state", &self.state)
            .field("connected", &self.connected)
            .field("expanded", &self.expanded)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder(machine: &mut PortalStateMachine) -> (ListenerHandle, Arc<Mutex<Vec<(PortalState, PortalState)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handle = machine.on_state_change(move |next, previous| {
            sink.lock().unwrap().push((next, previous));
        });
        (handle, seen)
    }

    #[test]
    fn listeners_see_sequential_pairs() {
        use PortalState::*;
        let mut machine = PortalStateMachine::new();
        let (_, seen) = recorder(&mut machine);

        for state in [Warm, Hot, Streaming, Cold, Warm, Cold] {
            assert!(machine.transition_to(state).unwrap());
        }
        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                (Warm, Cold),
                (Hot, Warm),
                (Streaming, Hot),
                (Cold, Streaming),
                (Warm, Cold),
                (Cold, Warm),
            ]
        );
        for pair in seen.windows(2) {
            assert_eq!(pair[0].0, pair[1].1, "no gaps between notifications");
        }
    }

    #[test]
    fn backwards_moves_are_rejected_and_repeats_are_no_ops() {
        let mut machine = PortalStateMachine::new();
        let (_, seen) = recorder(&mut machine);
        machine.transition_to(PortalState::Warm).unwrap();
        machine.transition_to(PortalState::Hot).unwrap();

        assert!(!machine.transition_to(PortalState::Hot).unwrap());
        assert_eq!(
            machine.transition_to(PortalState::Warm),
            Err(PortalError::InvalidTransition {
                from: PortalState::Hot,
                to: PortalState::Warm
            })
        );
        assert_eq!(machine.state(), PortalState::Hot);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn hot_sets_connected_before_listeners_run() {
        let mut machine = PortalStateMachine::new();
        machine.transition_to(PortalState::Warm).unwrap();
        let observed = Arc::new(Mutex::new(None));
        let sink = observed.clone();
        machine.on_state_change(move |next, _| {
            *sink.lock().unwrap() = Some(next);
        });
        machine.transition_to(PortalState::Hot).unwrap();
        assert!(machine.is_connected());
        assert_eq!(*observed.lock().unwrap(), Some(PortalState::Hot));
    }

    #[test]
    fn cold_clears_flags_and_removed_listeners_stay_quiet() {
        let mut machine = PortalStateMachine::new();
        let (handle, seen) = recorder(&mut machine);
        machine.transition_to(PortalState::Warm).unwrap();
        machine.set_expanded(true);
        machine.transition_to(PortalState::Hot).unwrap();
        assert!(machine.remove_listener(handle));
        assert!(!machine.remove_listener(handle));

        machine.transition_to(PortalState::Cold).unwrap();
        assert!(!machine.is_connected());
        assert!(!machine.is_expanded());
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn machines_do_not_share_listeners() {
        let mut first = PortalStateMachine::new();
        let mut second = PortalStateMachine::new();
        let (_, first_seen) = recorder(&mut first);
        second.transition_to(PortalState::Warm).unwrap();
        assert!(first_seen.lock().unwrap().is_empty());
    }

    #[test_timeout::paused_tokio_test(10)]
    async fn shutdown_waits_for_teardown_delay() {
        let mut machine = PortalStateMachine::new();
        let (_, seen) = recorder(&mut machine);
        machine.transition_to(PortalState::Warm).unwrap();
        machine.transition_to(PortalState::Hot).unwrap();
        machine.transition_to(PortalState::Streaming).unwrap();

        let started = tokio::time::Instant::now();
        machine.shutdown().await;
        assert!(started.elapsed() >= DEFAULT_TEARDOWN_DELAY);
        assert_eq!(machine.state(), PortalState::Cold);
        assert!(!machine.is_connected());
        assert_eq!(
            seen.lock().unwrap().last().copied(),
            Some((PortalState::Cold, PortalState::Streaming))
        );
    }

    #[test_timeout::paused_tokio_test(10)]
    async fn shutdown_from_cold_does_not_notify() {
        let mut machine = PortalStateMachine::with_teardown_delay(Duration::from_millis(10));
        let (_, seen) = recorder(&mut machine);
        machine.shutdown().await;
        assert_eq!(machine.state(), PortalState::Cold);
        assert!(seen.lock().unwrap().is_empty());
    }
}
