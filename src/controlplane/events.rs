//! Event sinks
//!
//! Events about the custom resource are fire and forget: a failed publish is
//! logged and never fails the reconcile pass.

use crate::domain::{EventSink, EventType, OperatorEvent};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType as KubeEventType, Recorder, Reporter};
use kube::Client;
use parking_lot::Mutex;
use tracing::warn;

/// Reporting component shown on every event
pub const CONTROLLER_NAME: &str = "operator-controller";

/// Action recorded on every event
const RECONCILE_ACTION: &str = "Reconcile";

/// [`EventSink`] backed by `kube::runtime::events::Recorder`
#[derive(Clone)]
pub struct KubeEventSink {
    client: Client,
    reporter: Reporter,
}

impl KubeEventSink {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            reporter: Reporter {
                controller: CONTROLLER_NAME.to_string(),
                instance: std::env::var("POD_NAME").ok(),
            },
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, regarding: &ObjectReference, event: OperatorEvent) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), regarding.clone());
        let reason = event.reason.clone();
        let result = recorder
            .publish(Event {
                type_: match event.event_type {
                    EventType::Normal => KubeEventType::Normal,
                    EventType::Warning => KubeEventType::Warning,
                },
                reason: event.reason,
                note: Some(event.message),
                action: RECONCILE_ACTION.to_string(),
                secondary: None,
            })
            .await;
        if let Err(e) = result {
            warn!(%reason, error = %e, "Failed to publish event");
        }
    }
}

/// Event sink that keeps everything in memory, for tests
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<OperatorEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event published so far, oldest first
    pub fn events(&self) -> Vec<OperatorEvent> {
        self.events.lock().clone()
    }

    /// Reasons of the events published so far
    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.reason.clone()).collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn publish(&self, _regarding: &ObjectReference, event: OperatorEvent) {
        self.events.lock().push(event);
    }
}
