//! Viewer fan-out.
//!
//! Each attached browser socket registers an unbounded sender; broadcasts
//! serialise one envelope and attempt delivery to every viewer, silently
//! dropping sockets whose receiving task has gone away.

use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

pub type ViewerId = u64;

#[derive(Default)]
pub struct ViewerHub {
    next_id: ViewerId,
    viewers: HashMap<ViewerId, mpsc::UnboundedSender<String>>,
}

impl ViewerHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, sender: mpsc::UnboundedSender<String>) -> ViewerId {
        let id = self.next_id;
        self.next_id += 1;
        self.viewers.insert(id, sender);
        debug!("Viewer {} attached ({} total)", id, self.viewers.len());
        id
    }

    pub fn detach(&mut self, id: ViewerId) {
        self.viewers.remove(&id);
        debug!("Viewer {} detached ({} remain)", id, self.viewers.len());
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    /// Send `{type, payload}` to every viewer, pruning closed sockets.
    pub fn broadcast<P: Serialize>(&mut self, event_type: &str, payload: &P) {
        let envelope = json!({
            "type": event_type,
            "payload": payload,
        })
        .to_string();

        self.viewers.retain(|id, sender| {
            let delivered = sender.send(envelope.clone()).is_ok();
            if !delivered {
                debug!("Dropping closed viewer {}", id);
            }
            delivered
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_all_open_viewers() {
        let mut hub = ViewerHub::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        hub.attach(tx1);
        hub.attach(tx2);

        hub.broadcast("session.created", &serde_json::json!({"sessionId": "s-1"}));

        let first = rx1.recv().await.unwrap();
        let second = rx2.recv().await.unwrap();
        assert_eq!(first, second);
        let parsed: serde_json::Value = serde_json::from_str(&first).unwrap();
        assert_eq!(parsed["type"], "session.created");
        assert_eq!(parsed["payload"]["sessionId"], "s-1");
    }

    #[tokio::test]
    async fn closed_viewers_are_pruned_silently() {
        let mut hub = ViewerHub::new();
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        hub.attach(tx1);
        hub.attach(tx2);
        drop(rx1);

        hub.broadcast("message.new", &serde_json::json!({"id": "m-1"}));
        assert_eq!(hub.viewer_count(), 1);
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn detach_removes_viewer() {
        let mut hub = ViewerHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = hub.attach(tx);
        hub.detach(id);

        hub.broadcast("activity.new", &serde_json::json!({}));
        assert!(rx.try_recv().is_err());
    }
}
