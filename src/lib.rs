//! HostPath Provisioner Operator
//!
//! A Kubernetes operator that deploys the hostpath CSI provisioner, keeps the
//! objects it needs converged, and manages per-node storage pools.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │              Controller (kube::runtime::Controller)              │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  Reconciler ── status state machine ── events / metrics          │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  Resource reconcilers            │  Storage pool fleet           │
//! │  daemon sets, RBAC, CSIDriver,   │  per-node Deployment + PVC,   │
//! │  SCC, monitoring                 │  cleanup Jobs                 │
//! ├──────────────────────────────────┴───────────────────────────────┤
//! │  Merge engine (last applied configuration, three-way merge)      │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  Object store: Kubernetes API │ in memory                        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: reconcile pass, controller wiring and admission webhook
//! - [`resources`]: one reconciler per family of managed objects
//! - [`merge`]: three-way merge of desired and live objects
//! - [`store`]: typed access to the object store
//! - [`crd`]: the HostPathProvisioner resource and external kinds
//! - [`domain`]: ports between the reconcilers and the cluster
//! - [`config`], [`naming`], [`error`]

pub mod config;
pub mod controlplane;
pub mod crd;
pub mod domain;
pub mod error;
pub mod merge;
pub mod naming;
pub mod resources;
pub mod store;

pub use config::OperatorConfig;
pub use controlplane::{Metrics, Outcome, Reconciler};
pub use crd::{HostPathProvisioner, HostPathProvisionerSpec, HostPathProvisionerStatus};
pub use error::{Error, ErrorAction, Result};
pub use store::{KubeObjectStore, MemoryObjectStore, Store};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
