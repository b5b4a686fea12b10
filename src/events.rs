// Copyright 2026 Unlist Contributors
// SPDX-License-Identifier: Apache-2.0

//! Engine event bus — the outbound hook surface of the core.
//!
//! The EventBus is a `tokio::sync::broadcast` channel carrying
//! [`EngineEvent`] values. Collaborators outside this core — the OS
//! notification layer, telemetry, a debug UI — subscribe independently.
//! When no subscribers exist, events are silently dropped (zero overhead).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Every event the engine emits. Serialized to JSON for external consumers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    // ── Scan / opt-out milestones ─────────
    /// A scan finished for one (broker, query) tuple.
    ScanCompleted {
        broker_url: String,
        match_count: usize,
    },
    /// The very first match across all brokers was found.
    FirstMatchFound,
    /// The first extracted profile was confirmed removed.
    FirstProfileRemoved,
    /// Every known extracted profile is now removed.
    AllProfilesRemoved,
    /// An opt-out request was submitted and awaits confirmation.
    OptOutRequested {
        broker_url: String,
        extracted_profile_id: i64,
    },

    // ── Failures ──────────────────────────
    /// A scan or opt-out job failed for one tuple.
    JobFailed {
        broker_url: String,
        kind: String,
        error: String,
    },
    /// A bundled broker definition file could not be loaded.
    BrokerLoadFailed { file: String, error: String },

    // ── Reconciliation ────────────────────
    /// A stored broker definition was replaced by a newer version.
    BrokerUpgraded {
        broker_url: String,
        from_version: String,
        to_version: String,
        opt_outs_reset: usize,
    },

    // ── System ────────────────────────────
    /// The scheduler finished one tick.
    TickCompleted {
        scans_run: usize,
        opt_outs_run: usize,
    },
    /// The engine started.
    EngineStarted { version: String },
}

/// The central event bus.
///
/// All components emit events through this bus. Consumers subscribe
/// to receive a stream of all events.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers. Silently ignores if no subscribers.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = EngineEvent::ScanCompleted {
            broker_url: "example.com".to_string(),
            match_count: 3,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("ScanCompleted"));
        assert!(json.contains("example.com"));

        // Roundtrip
        let parsed: EngineEvent = serde_json::from_str(&json).unwrap();
        match parsed {
            EngineEvent::ScanCompleted { match_count, .. } => assert_eq!(match_count, 3),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_event_bus_emit_no_subscribers() {
        let bus = EventBus::new(16);
        // Should not panic when no subscribers
        bus.emit(EngineEvent::FirstProfileRemoved);
    }

    #[test]
    fn test_event_bus_subscribe_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(EngineEvent::BrokerUpgraded {
            broker_url: "example.com".to_string(),
            from_version: "1.2".to_string(),
            to_version: "1.10".to_string(),
            opt_outs_reset: 2,
        });

        let event = rx.try_recv().unwrap();
        match event {
            EngineEvent::BrokerUpgraded { opt_outs_reset, .. } => assert_eq!(opt_outs_reset, 2),
            _ => panic!("wrong event"),
        }
    }
}
