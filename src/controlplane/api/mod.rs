//! HTTP surface of the operator
//!
//! The validating admission webhook, served by [`server::WebhookServer`].

pub mod server;
pub mod webhook;

pub use server::{WebhookServer, WebhookServerConfig};
pub use webhook::{review_response, validate_handler, VALIDATE_PATH};
