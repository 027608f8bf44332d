//! Network connectivity state and transmission gating.
//!
//! The host application observes the operating system's reachability API and
//! publishes changes through a [`ConnectivityHandle`]. The pipeline reads them
//! through a [`ConnectivityMonitor`] at the start of every send attempt.
//!
//! ```text
//! OS reachability ──► ConnectivityHandle::set() ──► watch channel
//!                                                        │
//!                     Worker: monitor.current() ◄────────┘
//!                             monitor.wait_for_change()
//! ```

use std::fmt;

use tokio::sync::watch;

use crate::record::Priority;

/// Network reachability as seen by the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NetworkState {
    /// No route to the collector.
    Unavailable,
    /// Reachable over a connection billed by volume (cellular, tethering).
    Metered,
    /// Reachable over an unmetered connection.
    Unmetered,
}

impl NetworkState {
    /// Returns true unless the network is unavailable.
    pub fn is_available(&self) -> bool {
        !matches!(self, NetworkState::Unavailable)
    }
}

impl fmt::Display for NetworkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkState::Unavailable => write!(f, "unavailable"),
            NetworkState::Metered => write!(f, "metered"),
            NetworkState::Unmetered => write!(f, "unmetered"),
        }
    }
}

/// Which priorities may be sent over a metered connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MeteredPolicy {
    pub normal: bool,
    pub high: bool,
    pub immediate: bool,
}

impl Default for MeteredPolicy {
    fn default() -> Self {
        Self {
            normal: false,
            high: true,
            immediate: true,
        }
    }
}

impl MeteredPolicy {
    /// Allow every priority on metered connections.
    pub fn allow_all() -> Self {
        Self {
            normal: true,
            high: true,
            immediate: true,
        }
    }

    /// Never transmit on metered connections.
    pub fn deny_all() -> Self {
        Self {
            normal: false,
            high: false,
            immediate: false,
        }
    }

    /// Whether `priority` may be sent on a metered connection.
    pub fn allows(&self, priority: Priority) -> bool {
        match priority {
            Priority::Normal => self.normal,
            Priority::High => self.high,
            Priority::Immediate => self.immediate,
        }
    }

    /// Priorities that may be transmitted in `state`.
    ///
    /// Empty when nothing may be sent.
    pub fn allowed_priorities(&self, state: NetworkState) -> Vec<Priority> {
        match state {
            NetworkState::Unavailable => Vec::new(),
            NetworkState::Unmetered => Priority::ALL.to_vec(),
            NetworkState::Metered => Priority::ALL
                .into_iter()
                .filter(|p| self.allows(*p))
                .collect(),
        }
    }
}

/// Publisher side, held by the host application.
#[derive(Clone, Debug)]
pub struct ConnectivityHandle {
    tx: watch::Sender<NetworkState>,
}

impl ConnectivityHandle {
    /// Publish a new network state. Repeating the current state is a no-op.
    pub fn set(&self, state: NetworkState) {
        self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                tracing::info!(from = %current, to = %state, "Connectivity changed");
                *current = state;
                true
            }
        });
    }

    /// The last published state.
    pub fn current(&self) -> NetworkState {
        *self.tx.borrow()
    }
}

/// Subscriber side, consumed by the pipeline worker.
#[derive(Clone, Debug)]
pub struct ConnectivityMonitor {
    rx: watch::Receiver<NetworkState>,
}

impl ConnectivityMonitor {
    /// Create a linked handle/monitor pair starting in `initial`.
    pub fn channel(initial: NetworkState) -> (ConnectivityHandle, ConnectivityMonitor) {
        let (tx, rx) = watch::channel(initial);
        (ConnectivityHandle { tx }, ConnectivityMonitor { rx })
    }

    /// A monitor pinned to `state` forever, for hosts without reachability
    /// information. [`ConnectivityMonitor::wait_for_change`] returns `None`.
    pub fn fixed(state: NetworkState) -> Self {
        let (_handle, monitor) = Self::channel(state);
        monitor
    }

    /// Current network state.
    pub fn current(&self) -> NetworkState {
        *self.rx.borrow()
    }

    /// Wait until a new state is published and return it.
    ///
    /// Returns `None` if the publishing handle was dropped; the state will
    /// never change again.
    pub async fn wait_for_change(&mut self) -> Option<NetworkState> {
        match self.rx.changed().await {
            Ok(()) => Some(*self.rx.borrow_and_update()),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_metered_policy() {
        let policy = MeteredPolicy::default();
        assert!(!policy.allows(Priority::Normal));
        assert!(policy.allows(Priority::High));
        assert!(policy.allows(Priority::Immediate));
    }

    #[test]
    fn test_allowed_priorities_by_state() {
        let policy = MeteredPolicy::default();
        assert!(policy
            .allowed_priorities(NetworkState::Unavailable)
            .is_empty());
        assert_eq!(
            policy.allowed_priorities(NetworkState::Unmetered),
            Priority::ALL.to_vec()
        );
        assert_eq!(
            policy.allowed_priorities(NetworkState::Metered),
            vec![Priority::High, Priority::Immediate]
        );
        assert!(MeteredPolicy::deny_all()
            .allowed_priorities(NetworkState::Metered)
            .is_empty());
        assert_eq!(
            MeteredPolicy::allow_all().allowed_priorities(NetworkState::Metered),
            Priority::ALL.to_vec()
        );
    }

    #[test]
    fn test_handle_publishes_state() {
        let (handle, monitor) = ConnectivityMonitor::channel(NetworkState::Unmetered);
        assert_eq!(monitor.current(), NetworkState::Unmetered);

        handle.set(NetworkState::Unavailable);
        assert_eq!(monitor.current(), NetworkState::Unavailable);
        assert_eq!(handle.current(), NetworkState::Unavailable);
    }

    #[tokio::test]
    async fn test_wait_for_change() {
        let (handle, mut monitor) = ConnectivityMonitor::channel(NetworkState::Unavailable);

        let waiter = tokio::spawn(async move { monitor.wait_for_change().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.set(NetworkState::Metered);

        let state = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, Some(NetworkState::Metered));
    }

    #[tokio::test]
    async fn test_wait_returns_none_when_handle_dropped() {
        let (handle, mut monitor) = ConnectivityMonitor::channel(NetworkState::Unmetered);
        drop(handle);
        assert_eq!(monitor.wait_for_change().await, None);
    }

    #[test]
    fn test_fixed_monitor() {
        let monitor = ConnectivityMonitor::fixed(NetworkState::Metered);
        assert_eq!(monitor.current(), NetworkState::Metered);
    }
}
