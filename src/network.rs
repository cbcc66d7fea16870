//! Network state derived from platform connectivity signals.

use n0_future::{Stream, StreamExt};

/// Connectivity as seen by the sync core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkState {
    /// Offline since startup.
    Offline,
    /// Online since startup.
    Online,
    /// Lost the connection.
    Disconnected,
    /// Got the connection back.
    Reconnected,
}

impl NetworkState {
    /// Whether the network can be used.
    pub fn is_up(self) -> bool {
        matches!(self, NetworkState::Online | NetworkState::Reconnected)
    }
}

/// A platform connectivity event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Connectivity {
    /// The device got a connection.
    Connected,
    /// The device lost its connection.
    Disconnected,
}

/// Turns connectivity events into [`NetworkState`]s.
#[derive(Debug, Clone)]
pub struct NetworkStateTracker {
    state: NetworkState,
}

impl NetworkStateTracker {
    /// Starts from the synchronous reading taken when the platform is ready.
    pub fn new(connected: bool) -> Self {
        let state = if connected {
            NetworkState::Online
        } else {
            NetworkState::Offline
        };
        Self { state }
    }

    /// The current state.
    pub fn state(&self) -> NetworkState {
        self.state
    }

    /// Applies an event, returning the new state if it changed.
    pub fn apply(&mut self, event: Connectivity) -> Option<NetworkState> {
        let next = match (event, self.state.is_up()) {
            (Connectivity::Connected, false) => NetworkState::Reconnected,
            (Connectivity::Disconnected, true) => NetworkState::Disconnected,
            _ => return None,
        };
        self.state = next;
        Some(next)
    }
}

/// The stream of network states: the initial state, then one state per change.
pub fn network_states(
    connected: bool,
    events: impl Stream<Item = Connectivity> + Send + 'static,
) -> impl Stream<Item = NetworkState> + Send + 'static {
    let mut tracker = NetworkStateTracker::new(connected);
    let initial = tracker.state();
    n0_future::stream::once(initial).chain(events.filter_map(move |event| tracker.apply(event)))
}
