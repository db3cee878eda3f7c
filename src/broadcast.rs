use crate::protocol::{self, WireMessage};
use crate::transport::Connection;
use crate::types::ConnectionId;
use std::sync::Arc;

/// Result of one fan-out call
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    /// Connections that were closed or refused the frame
    pub failed: Vec<ConnectionId>,
}

impl DeliveryReport {
    pub fn all_delivered(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Host-side set of live guest connections, in connection order.
///
/// Delivery is best effort and at most once per connection per call: a failure
/// on one connection is logged and reported, and never stops delivery to the
/// rest. Nothing is rolled back.
#[derive(Default)]
pub struct Fanout {
    connections: Vec<Arc<dyn Connection>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a connection. Returns false if the id is already tracked.
    pub fn insert(&mut self, conn: Arc<dyn Connection>) -> bool {
        if self.contains(conn.id()) {
            return false;
        }
        self.connections.push(conn);
        true
    }

    pub fn remove(&mut self, id: &ConnectionId) -> Option<Arc<dyn Connection>> {
        let index = self.connections.iter().position(|c| c.id() == id)?;
        Some(self.connections.remove(index))
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.iter().any(|c| c.id() == id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Send to every tracked connection
    pub fn broadcast(&self, msg: &WireMessage) -> DeliveryReport {
        self.deliver(msg, |_| true)
    }

    /// Send to the listed connections only; unknown ids are skipped
    pub fn send_to(&self, ids: &[ConnectionId], msg: &WireMessage) -> DeliveryReport {
        self.deliver(msg, |conn| ids.contains(conn.id()))
    }

    fn deliver<F>(&self, msg: &WireMessage, include: F) -> DeliveryReport
    where
        F: Fn(&dyn Connection) -> bool,
    {
        let mut report = DeliveryReport::default();

        let text = match protocol::encode(msg) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Failed to encode {} message: {}", msg.kind(), e);
                return report;
            }
        };

        for conn in &self.connections {
            let conn: &dyn Connection = conn.as_ref();
            if !include(conn) {
                continue;
            }
            if !conn.is_open() {
                tracing::warn!("Skipping closed connection {}", conn.id());
                report.failed.push(conn.id().clone());
                continue;
            }
            match conn.send_text(text.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::error!("Send of {} to {} failed: {}", msg.kind(), conn.id(), e);
                    report.failed.push(conn.id().clone());
                }
            }
        }

        tracing::debug!(
            "Delivered {} to {} connection(s), {} failed",
            msg.kind(),
            report.delivered,
            report.failed.len()
        );
        report
    }
}
