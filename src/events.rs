//! Domain event fan-out.
//!
//! The engine publishes fire-and-forget notifications through the
//! [`EventSink`] trait. [`BroadcastSink`] is the in-process transport:
//! a `tokio::sync::broadcast` channel that any number of subscribers
//! (the status API, log forwarders, tests) can listen on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::sync::broadcast;
use tracing::debug;

const DEFAULT_CAPACITY: usize = 256;

/// Kind of notification published by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TokenDetected,
    TradingEnabled,
    TransferStarted,
    TransferCompleted,
    TransferFailed,
    TransferConfirmed,
    TransferUnconfirmed,
    NetworkStatus,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::TokenDetected => "token_detected",
            EventKind::TradingEnabled => "trading_enabled",
            EventKind::TransferStarted => "transfer_started",
            EventKind::TransferCompleted => "transfer_completed",
            EventKind::TransferFailed => "transfer_failed",
            EventKind::TransferConfirmed => "transfer_confirmed",
            EventKind::TransferUnconfirmed => "transfer_unconfirmed",
            EventKind::NetworkStatus => "network_status",
        };
        write!(f, "{s}")
    }
}

/// A published notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub kind: EventKind,
    /// `None` for global events such as network status.
    pub wallet: Option<String>,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

/// Fire-and-forget publication seam.
pub trait EventSink: Send + Sync {
    fn publish(&self, kind: EventKind, payload: Value, wallet: Option<&str>);
}

/// Broadcast-channel sink. Publishing with no subscribers is a no-op.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<DomainEvent>,
}

impl BroadcastSink {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }

    /// Subscription that only yields events for `wallet` plus global ones.
    pub fn subscribe_wallet(&self, wallet: &str) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            wallet: crate::types::normalize_id(wallet),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, kind: EventKind, payload: Value, wallet: Option<&str>) {
        let event = DomainEvent {
            kind,
            wallet: wallet.map(str::to_string),
            payload,
            at: Utc::now(),
        };
        if self.tx.send(event).is_err() {
            debug!(kind = %kind, "Event dropped, no subscribers");
        }
    }
}

/// Receiver filtered to one wallet.
pub struct EventSubscription {
    rx: broadcast::Receiver<DomainEvent>,
    wallet: Option<String>,
}

impl EventSubscription {
    /// Next matching event; `None` once the sink is dropped. Lagged
    /// receivers skip the missed events and keep going.
    pub async fn recv(&mut self) -> Option<DomainEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn matches(&self, event: &DomainEvent) -> bool {
        match (&self.wallet, &event.wallet) {
            (Some(wanted), Some(actual)) => wanted == actual,
            _ => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
