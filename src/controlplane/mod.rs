//! Control Plane
//!
//! Drives the HostPathProvisioner: the reconcile pass and its status state
//! machine, the controller wiring around it, event and metric reporting,
//! namespace and version providers, and the admission webhook.

pub mod api;
pub mod events;
pub mod metrics;
pub mod providers;
pub mod reconciler;
pub mod runtime;
pub mod status;

pub use events::{KubeEventSink, MemoryEventSink};
pub use metrics::Metrics;
pub use providers::{
    EnvNamespaceProvider, FileVersionProvider, StaticNamespaceProvider, StaticVersionProvider,
};
pub use reconciler::{Outcome, Reconciler};
