//! Custom Resource Definitions
//!
//! - HostPathProvisioner: the operator's own singleton resource
//! - External kinds written by the operator when their API group is served:
//!   SecurityContextConstraints, PrometheusRule and ServiceMonitor

pub mod external;
pub mod hostpath_provisioner;
pub mod validation;

pub use external::*;
pub use hostpath_provisioner::*;
pub use validation::validate;
