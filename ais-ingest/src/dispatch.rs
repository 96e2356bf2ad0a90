//! Route decoded envelopes to the handler registered for their message type.
use std::collections::HashMap;
use std::sync::Arc;

use ais_common::ais::Envelope;
use ais_common::store::VesselStore;
use async_trait::async_trait;
use tracing::{debug, error};

use crate::error::HandlerError;
use crate::metrics_consts::{HANDLER_FAILURES, MESSAGES_HANDLED, MESSAGES_UNHANDLED};

/// Message types the feed is known to send. Anything else is labelled `other` in metrics, so
/// a misbehaving feed cannot grow the label set without bound.
const KNOWN_MESSAGE_TYPES: &[&str] = &[
    "AddressedBinaryMessage",
    "AddressedSafetyMessage",
    "AidsToNavigationReport",
    "AssignedModeCommand",
    "BaseStationReport",
    "BinaryAcknowledge",
    "BinaryBroadcastMessage",
    "ChannelManagement",
    "CoordinatedUTCInquiry",
    "DataLinkManagementMessage",
    "DataLinkManagementMessageData",
    "ExtendedClassBPositionReport",
    "GnssBroadcastBinaryMessage",
    "GroupAssignmentCommand",
    "Interrogation",
    "LongRangeAisBroadcastMessage",
    "MultiSlotBinaryMessage",
    "PositionReport",
    "SafetyBroadcastMessage",
    "ShipStaticData",
    "SingleSlotBinaryMessage",
    "StandardClassBPositionReport",
    "StandardSearchAndRescueAircraftReport",
    "StaticDataReport",
    "StaticReport",
    "UnknownMessage",
];

fn message_type_label(message_type: &str) -> &'static str {
    KNOWN_MESSAGE_TYPES
        .iter()
        .find(|known| **known == message_type)
        .copied()
        .unwrap_or("other")
}

/// Handles one category of message, whichever wire label it arrived under.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Short category name used in logs and metric labels.
    fn name(&self) -> &'static str;

    async fn handle(&self, store: &dyn VesselStore, envelope: &Envelope)
        -> Result<(), HandlerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    Unhandled,
    Failed,
}

#[derive(Default)]
pub struct DispatcherBuilder {
    routes: HashMap<String, Arc<dyn MessageHandler>>,
}

impl DispatcherBuilder {
    /// Route every label in `labels` to `handler`. A later registration of the same label
    /// replaces the earlier one.
    pub fn register(mut self, labels: &[&str], handler: Arc<dyn MessageHandler>) -> Self {
        for label in labels {
            self.routes.insert((*label).to_owned(), handler.clone());
        }
        self
    }

    pub fn build(self, store: Arc<dyn VesselStore>) -> Dispatcher {
        Dispatcher {
            routes: self.routes,
            store,
        }
    }
}

/// Routing table built once at startup. Shared between dispatch tasks, never mutated.
pub struct Dispatcher {
    routes: HashMap<String, Arc<dyn MessageHandler>>,
    store: Arc<dyn VesselStore>,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    pub fn handles(&self, label: &str) -> bool {
        self.routes.contains_key(label)
    }

    /// Run the handler for this envelope. Failures are logged here and never propagate.
    pub async fn dispatch(&self, envelope: &Envelope) -> DispatchOutcome {
        let Some(handler) = self.routes.get(&envelope.message_type) else {
            debug!(message_type = %envelope.message_type, "unhandled message type");
            metrics::counter!(
                MESSAGES_UNHANDLED,
                "message_type" => message_type_label(&envelope.message_type)
            )
            .increment(1);
            return DispatchOutcome::Unhandled;
        };

        match handler.handle(self.store.as_ref(), envelope).await {
            Ok(()) => {
                metrics::counter!(MESSAGES_HANDLED, "handler" => handler.name()).increment(1);
                DispatchOutcome::Handled
            }
            Err(e) => {
                error!(
                    message_type = %envelope.message_type,
                    mmsi = ?envelope.mmsi(),
                    error = %e,
                    "handler failed"
                );
                metrics::counter!(HANDLER_FAILURES, "handler" => handler.name()).increment(1);
                DispatchOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use ais_common::store::{MemoryStore, StoreError};

    use super::*;

    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl MessageHandler for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn handle(
            &self,
            _store: &dyn VesselStore,
            _envelope: &Envelope,
        ) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(StoreError::Unavailable("down".to_owned()).into())
            } else {
                Ok(())
            }
        }
    }

    fn envelope(message_type: &str) -> Envelope {
        Envelope::parse(&format!(
            r#"{{"MessageType": "{}", "MetaData": {{"MMSI": 123456789}}, "Message": {{}}}}"#,
            message_type
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_one_handler_under_several_labels() {
        let handler = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let dispatcher = Dispatcher::builder()
            .register(&["A", "B", "C"], handler.clone())
            .build(Arc::new(MemoryStore::new()));

        for label in ["A", "B", "C"] {
            assert_eq!(
                dispatcher.dispatch(&envelope(label)).await,
                DispatchOutcome::Handled
            );
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unregistered_label_is_a_no_op() {
        let handler = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let dispatcher = Dispatcher::builder()
            .register(&["A"], handler.clone())
            .build(Arc::new(MemoryStore::new()));

        assert!(!dispatcher.handles("SafetyBroadcastMessage"));
        assert_eq!(
            dispatcher.dispatch(&envelope("SafetyBroadcastMessage")).await,
            DispatchOutcome::Unhandled
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unknown_message_types_share_one_label() {
        assert_eq!(
            message_type_label("SafetyBroadcastMessage"),
            "SafetyBroadcastMessage"
        );
        assert_eq!(message_type_label("Garbage-1"), "other");
        assert_eq!(message_type_label("Garbage-2"), "other");
    }

    #[tokio::test]
    async fn test_handler_failure_is_contained() {
        let failing = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let healthy = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let dispatcher = Dispatcher::builder()
            .register(&["Bad"], failing)
            .register(&["Good"], healthy.clone())
            .build(Arc::new(MemoryStore::new()));

        assert_eq!(
            dispatcher.dispatch(&envelope("Bad")).await,
            DispatchOutcome::Failed
        );
        assert_eq!(
            dispatcher.dispatch(&envelope("Good")).await,
            DispatchOutcome::Handled
        );
        assert_eq!(healthy.calls.load(Ordering::SeqCst), 1);
    }
}
