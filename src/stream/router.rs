//! Bus receive path
//!
//! One thread per session reads everything heard on the bus, keeps what is
//! addressed to this node and routes the samples into the pending buffers.
//! It never touches the series store.

use crate::bus::{BusMessage, Response};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::pending::PendingBuffer;

/// Outstanding requests older than this are forgotten
const OUTSTANDING_TTL: Duration = Duration::from_secs(30);

/// How often the receive loop re-checks the running flag
const RECEIVE_POLL: Duration = Duration::from_millis(50);

/// Message ids of requests waiting for a response
#[derive(Debug, Default)]
pub struct Correlator {
    outstanding: Mutex<HashMap<String, Instant>>,
}

impl Correlator {
    /// Create an empty correlator
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember an issued request
    pub fn register(&self, msg_id: &str) {
        let mut outstanding = self.lock();
        let now = Instant::now();
        outstanding.retain(|_, issued| now.duration_since(*issued) < OUTSTANDING_TTL);
        outstanding.insert(msg_id.to_string(), now);
    }

    /// Decide whether a response belongs to one of our requests
    ///
    /// Responses without a message id cannot be checked and are accepted;
    /// a known id is consumed.
    pub fn accept(&self, msg_id: Option<&str>) -> bool {
        match msg_id {
            None => true,
            Some(id) => self.lock().remove(id).is_some(),
        }
    }

    /// Number of requests still waiting
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
        self.outstanding
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Routes correlated responses into per-variable buffers
#[derive(Debug)]
pub struct ResponseRouter {
    group: String,
    receiver_id: String,
    buffers: HashMap<String, Arc<PendingBuffer>>,
    correlator: Arc<Correlator>,
}

impl ResponseRouter {
    /// Create a router for the node `receiver_id` listening on `group`
    pub fn new(
        group: impl Into<String>,
        receiver_id: impl Into<String>,
        buffers: HashMap<String, Arc<PendingBuffer>>,
        correlator: Arc<Correlator>,
    ) -> Self {
        Self {
            group: group.into(),
            receiver_id: receiver_id.into(),
            buffers,
            correlator,
        }
    }

    /// Handle one bus message. Returns true if it reached a buffer.
    pub fn route(&self, message: &BusMessage) -> bool {
        if message.group != self.group {
            return false;
        }

        let response = match Response::parse(&message.payload, &self.receiver_id) {
            Ok(Some(response)) => response,
            Ok(None) => return false,
            Err(e) => {
                tracing::trace!("Ignoring message from {}: {}", message.sender, e);
                return false;
            }
        };

        if !self.correlator.accept(response.msg_id()) {
            tracing::trace!(
                "Ignoring {} response with unknown msgId {:?}",
                response.kind(),
                response.msg_id()
            );
            return false;
        }

        let mut routed = false;
        match response {
            Response::Catalog(_) => {
                tracing::trace!("Ignoring catalog response while streaming");
            }
            Response::Latest { data, .. } => {
                for (name, point) in data {
                    routed |= self.push(&name, [point]);
                }
            }
            Response::Window { data, .. } => {
                for (name, points) in data {
                    routed |= self.push(&name, points);
                }
            }
        }
        routed
    }

    fn push(&self, name: &str, points: impl IntoIterator<Item = crate::types::SamplePoint>) -> bool {
        match self.buffers.get(name) {
            Some(buffer) => {
                buffer.push_response(points);
                true
            }
            None => {
                tracing::trace!("Ignoring samples for unselected variable '{}'", name);
                false
            }
        }
    }

    /// Receive until `running` clears or the subscription closes
    pub fn run(self, inbox: Receiver<BusMessage>, running: Arc<AtomicBool>) {
        tracing::debug!("Bus receive loop started for {} variables", self.buffers.len());
        while running.load(Ordering::SeqCst) {
            match inbox.recv_timeout(RECEIVE_POLL) {
                Ok(message) => {
                    self.route(&message);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    tracing::warn!("Bus subscription closed; no further responses will arrive");
                    break;
                }
            }
        }
        tracing::debug!("Bus receive loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Request;
    use crate::types::SamplePoint;

    const ME: &str = "me";

    fn router(names: &[&str]) -> (ResponseRouter, HashMap<String, Arc<PendingBuffer>>, Arc<Correlator>) {
        let buffers: HashMap<_, _> = names
            .iter()
            .map(|n| (n.to_string(), Arc::new(PendingBuffer::new(*n, None))))
            .collect();
        let correlator = Arc::new(Correlator::new());
        let router = ResponseRouter::new("ROPOD", ME, buffers.clone(), correlator.clone());
        (router, buffers, correlator)
    }

    fn message(payload: String) -> BusMessage {
        BusMessage {
            group: "ROPOD".into(),
            sender: "bb".into(),
            payload,
        }
    }

    fn window(msg_id: Option<&str>, name: &str, points: Vec<SamplePoint>) -> String {
        Response::Window {
            msg_id: msg_id.map(str::to_string),
            data: vec![(name.to_string(), points)],
        }
        .to_json(ME)
        .unwrap()
    }

    #[test]
    fn test_routes_window_to_buffer() {
        let (router, buffers, correlator) = router(&["x", "y"]);
        let request = Request::data("bb", ME, 0.0, &["x".to_string()]);
        correlator.register(&request.msg_id);

        let raw = window(Some(&request.msg_id), "x", vec![SamplePoint::new(1.0, 2.0)]);
        assert!(router.route(&message(raw)));
        assert_eq!(buffers["x"].len(), 1);
        assert_eq!(buffers["y"].responses(), 0);
        assert_eq!(correlator.pending(), 0);
    }

    #[test]
    fn test_unknown_msg_id_is_ignored() {
        let (router, buffers, _) = router(&["x"]);
        let raw = window(Some("never-sent"), "x", vec![SamplePoint::new(1.0, 2.0)]);
        assert!(!router.route(&message(raw)));
        assert_eq!(buffers["x"].responses(), 0);
    }

    #[test]
    fn test_response_without_msg_id_is_accepted() {
        let (router, buffers, _) = router(&["x"]);
        let raw = window(None, "x", vec![SamplePoint::new(1.0, 2.0)]);
        assert!(router.route(&message(raw)));
        assert_eq!(buffers["x"].len(), 1);
    }

    #[test]
    fn test_foreign_group_receiver_and_garbage_ignored() {
        let (router, buffers, _) = router(&["x"]);
        let mut wrong_group = message(window(None, "x", vec![SamplePoint::new(1.0, 2.0)]));
        wrong_group.group = "OTHER".into();
        assert!(!router.route(&wrong_group));

        let foreign = Response::Window {
            msg_id: None,
            data: vec![("x".into(), vec![SamplePoint::new(1.0, 2.0)])],
        }
        .to_json("someone-else")
        .unwrap();
        assert!(!router.route(&message(foreign)));
        assert!(!router.route(&message("{{{".into())));
        assert_eq!(buffers["x"].responses(), 0);
    }

    #[test]
    fn test_latest_routes_per_variable() {
        let (router, buffers, _) = router(&["x", "y"]);
        let raw = Response::Latest {
            msg_id: None,
            data: vec![
                ("x".into(), SamplePoint::new(1.0, 1.0)),
                ("z".into(), SamplePoint::new(1.0, 1.0)),
            ],
        }
        .to_json(ME)
        .unwrap();
        assert!(router.route(&message(raw)));
        assert_eq!(buffers["x"].len(), 1);
        assert!(buffers["y"].is_empty());
    }

    #[test]
    fn test_run_exits_on_flag_and_disconnect() {
        let (router, _, _) = router(&["x"]);
        let (tx, rx) = crossbeam_channel::unbounded();
        drop(tx);
        router.run(rx, Arc::new(AtomicBool::new(true)));

        let (router, _, _) = self::router(&["x"]);
        let (_tx, rx) = crossbeam_channel::unbounded();
        router.run(rx, Arc::new(AtomicBool::new(false)));
    }
}
