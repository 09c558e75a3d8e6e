//! Per-tag message services
//!
//! The messaging layer delivers inbound end-to-end messages to services keyed
//! by an identifier and a tag. Every partner gets one service per registered
//! tag, identified by the partner's connection fingerprint.

use std::sync::Arc;

use crate::ids::PartnerId;

/// Tag of the service receiving ordinary end-to-end messages
pub const E2E_TAG: &str = "E2e";

/// Tag of the service receiving messages that must not notify the user
pub const SILENT_TAG: &str = "Silent";

/// A message service registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Service {
    /// Matches inbound messages to this service
    pub identifier: Vec<u8>,
    /// Kind of traffic handled
    pub tag: String,
    /// Opaque data handed back with each message
    pub metadata: Vec<u8>,
}

/// Consumes messages delivered to a service.
pub trait Processor: Send + Sync {
    /// Handle one decrypted message from `sender`.
    fn process(&self, sender: PartnerId, payload: &[u8]);
}

/// Installs and removes services in the messaging layer.
pub trait ServiceHandler: Send + Sync {
    /// Start delivering messages for `service` to `processor`.
    fn add_service(&self, service: Service, processor: Arc<dyn Processor>);

    /// Stop delivering messages for `service`.
    fn delete_service(&self, service: &Service, processor: &Arc<dyn Processor>);
}

/// Service handler that installs nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopServiceHandler;

impl ServiceHandler for NoopServiceHandler {
    fn add_service(&self, _service: Service, _processor: Arc<dyn Processor>) {}

    fn delete_service(&self, _service: &Service, _processor: &Arc<dyn Processor>) {}
}
