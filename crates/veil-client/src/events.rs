//! Connection events for observers

use crate::server::ServerDescriptor;
use crate::state::{ConnectionState, DisconnectReason};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::sync::Mutex;
use veil_redirect::{RecoveryReport, RedirectWarning, RestoreOutcome};

/// Result of tearing a connection down.
///
/// A report with failures means some setting may still point at the
/// local proxy; the backups for it are kept so the next recovery scan
/// retries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub warnings: Vec<RedirectWarning>,
    pub failures: Vec<String>,
}

impl TeardownReport {
    /// Everything was restored
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub(crate) fn absorb(&mut self, outcome: RestoreOutcome) {
        self.warnings.extend(outcome.warnings);
        self.failures
            .extend(outcome.failures.into_iter().map(|e| e.to_string()));
    }
}

/// Something observers may care about
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged {
        old: ConnectionState,
        new: ConnectionState,
    },
    Connected {
        server: ServerDescriptor,
    },
    Disconnected {
        reason: DisconnectReason,
        report: TeardownReport,
    },
    /// Leftover redirection from an earlier session was restored
    RecoveryPerformed(RecoveryReport),
    Error {
        message: String,
    },
}

/// Fan-out of events to any number of subscribers
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<ConnectionEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<ConnectionEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Deliver to every live subscriber, dropping closed ones
    pub fn emit(&self, event: ConnectionEvent) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_reaches_all_subscribers() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();

        bus.emit(ConnectionEvent::Error { message: "boom".into() });

        assert!(matches!(a.try_recv(), Ok(ConnectionEvent::Error { .. })));
        assert!(matches!(b.try_recv(), Ok(ConnectionEvent::Error { .. })));
    }

    #[test]
    fn test_closed_subscribers_are_pruned() {
        let bus = EventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());

        bus.emit(ConnectionEvent::StateChanged {
            old: ConnectionState::Disconnected,
            new: ConnectionState::Connecting,
        });

        assert_eq!(bus.subscriber_count(), 1);
        assert!(kept.try_recv().is_ok());
    }
}
