//! Publish/subscribe bus seam
//!
//! The synchronizer only needs two things from a transport: shouting a text
//! payload to a group, and a stream of everything heard on the bus. The
//! [`Bus`] trait captures that; [`LocalBus`] implements it in-process on top
//! of crossbeam channels for demos, tests and embedding.
//!
//! # Components
//!
//! - [`protocol`] - request builders and response parsing for the
//!   VARIABLE-QUERY / LATEST-DATA-QUERY / DATA-QUERY exchange
//! - [`MockBlackBox`] - simulated remote source answering queries on a bus
//!   (feature `mock-source`)

#[cfg(feature = "mock-source")]
pub mod mock_source;
pub mod protocol;

#[cfg(feature = "mock-source")]
pub use mock_source::{MockBlackBox, MockDataPattern, MockVariableConfig};
pub use protocol::{QueryKind, Request, Response};

use crate::error::{DataFeedError, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A message heard on the bus
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    /// Group the message was shouted to
    pub group: String,
    /// Name of the shouting node
    pub sender: String,
    /// Text payload
    pub payload: String,
}

/// Publish/subscribe transport
#[cfg_attr(test, mockall::automock)]
pub trait Bus: Send + Sync {
    /// Name of this node on the bus
    fn node_name(&self) -> String;

    /// Send `payload` to every member of `group`
    fn shout(&self, group: &str, payload: &str) -> Result<()>;

    /// Start receiving every message shouted by other nodes
    ///
    /// Dropping the receiver ends the subscription.
    fn subscribe(&self) -> Receiver<BusMessage>;
}

#[derive(Debug, Default)]
struct Hub {
    subscribers: Mutex<Vec<Subscriber>>,
    closed: AtomicBool,
    next_node: AtomicU64,
}

#[derive(Debug)]
struct Subscriber {
    node: u64,
    sender: Sender<BusMessage>,
}

/// In-process broadcast bus
///
/// Every handle created through [`LocalBus::join`] shares one hub and
/// receives what the other handles shout. A node never hears itself.
#[derive(Debug, Clone)]
pub struct LocalBus {
    hub: Arc<Hub>,
    node: u64,
    name: String,
}

impl LocalBus {
    /// Create a new hub and its first node
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            hub: Arc::new(Hub::default()),
            node: 0,
            name: name.into(),
        }
        .with_fresh_id()
    }

    fn with_fresh_id(mut self) -> Self {
        self.node = self.hub.next_node.fetch_add(1, Ordering::SeqCst);
        self
    }

    /// Join the same hub as another node
    pub fn join(&self, name: impl Into<String>) -> Self {
        Self {
            hub: self.hub.clone(),
            node: 0,
            name: name.into(),
        }
        .with_fresh_id()
    }

    /// Take the hub down; further shouts fail with `ConnectionUnavailable`
    pub fn close(&self) {
        self.hub.closed.store(true, Ordering::SeqCst);
        self.hub
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    /// Bring a closed hub back up
    pub fn reopen(&self) {
        self.hub.closed.store(false, Ordering::SeqCst);
    }

    /// Check whether the hub is closed
    pub fn is_closed(&self) -> bool {
        self.hub.closed.load(Ordering::SeqCst)
    }

    /// Number of registered subscriptions over all nodes
    ///
    /// Dropped subscriptions are pruned lazily by the next shout of another
    /// node.
    pub fn subscriber_count(&self) -> usize {
        self.hub
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

impl Bus for LocalBus {
    fn node_name(&self) -> String {
        self.name.clone()
    }

    fn shout(&self, group: &str, payload: &str) -> Result<()> {
        if self.is_closed() {
            return Err(DataFeedError::ConnectionUnavailable(format!(
                "bus is closed, '{}' cannot shout to {}",
                self.name, group
            )));
        }

        let message = BusMessage {
            group: group.to_string(),
            sender: self.name.clone(),
            payload: payload.to_string(),
        };

        let mut subscribers = self
            .hub
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.retain(|s| s.node == self.node || s.sender.send(message.clone()).is_ok());
        Ok(())
    }

    fn subscribe(&self) -> Receiver<BusMessage> {
        let (tx, rx) = unbounded();
        if !self.is_closed() {
            self.hub
                .subscribers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(Subscriber {
                    node: self.node,
                    sender: tx,
                });
        }
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_shout_reaches_other_nodes_only() {
        let a = LocalBus::new("a");
        let b = a.join("b");
        let rx_a = a.subscribe();
        let rx_b = b.subscribe();

        a.shout("ROPOD", "hello").unwrap();

        let msg = rx_b.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(msg.group, "ROPOD");
        assert_eq!(msg.sender, "a");
        assert_eq!(msg.payload, "hello");
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_dropped_subscription_is_pruned() {
        let a = LocalBus::new("a");
        let b = a.join("b");
        let rx = b.subscribe();
        assert_eq!(a.subscriber_count(), 1);
        drop(rx);
        a.shout("g", "x").unwrap();
        assert_eq!(a.subscriber_count(), 0);
    }

    #[test]
    fn test_closed_bus_refuses_shouts() {
        let a = LocalBus::new("a");
        let b = a.join("b");
        let rx = b.subscribe();
        a.close();

        let err = a.shout("g", "x").unwrap_err();
        assert!(matches!(err, DataFeedError::ConnectionUnavailable(_)));
        assert!(rx.recv_timeout(Duration::from_millis(20)).is_err());

        a.reopen();
        let rx = b.subscribe();
        a.shout("g", "x").unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_ok());
    }

    #[test]
    fn test_discovery_shouts_variable_query() {
        use crate::config::AppConfig;
        use crate::stream::Synchronizer;

        let mut config = AppConfig::default();
        config.discovery.timeout_ms = 50;
        let expected = config.bus.clone();

        let mut bus = MockBus::new();
        // A subscription whose sender is already gone ends the wait at once
        bus.expect_subscribe()
            .times(1)
            .returning(|| unbounded().1);
        bus.expect_shout()
            .withf(move |group, payload| {
                group.to_string() == expected.group
                    && Request::parse(payload).is_ok_and(|r| {
                        r.kind == QueryKind::Variables
                            && r.source_id == expected.source_id
                            && r.sender_id == expected.sender_id
                    })
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let mut sync = Synchronizer::new(config, bus);
        assert!(matches!(
            sync.discover(),
            Err(DataFeedError::DiscoveryTimeout { .. })
        ));
    }

    #[test]
    fn test_discovery_surfaces_shout_failure() {
        use crate::config::AppConfig;
        use crate::stream::{Synchronizer, SyncState};

        let mut bus = MockBus::new();
        bus.expect_subscribe()
            .returning(|| unbounded().1);
        bus.expect_shout()
            .times(1)
            .returning(|_, _| Err(DataFeedError::ConnectionUnavailable("down".into())));

        let mut sync = Synchronizer::new(AppConfig::default(), bus);
        assert!(matches!(
            sync.discover(),
            Err(DataFeedError::ConnectionUnavailable(_))
        ));
        assert_eq!(sync.state(), SyncState::Idle);
    }
}
