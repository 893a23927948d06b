//! Default collaborator implementations wired at boot so the daemon is
//! runnable standalone. The real transport driver and perspective
//! projections are external collaborators (§6) supplied by whatever
//! embeds these crates; this module's job ends at logging what it was
//! asked to do.

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use wh_db::EventRow;
use wh_worker::{PerspectiveHandler, ReceptorHandler, Transport};

/// Logs every publish call instead of sending anywhere. Stands in for a
/// real transport driver (AMQP, Kafka, webhook dispatch, ...).
pub struct LoggingTransport;

#[async_trait]
impl Transport for LoggingTransport {
    async fn publish(
        &self,
        destination: &str,
        envelope_type: &str,
        envelope_data: &Value,
        metadata: &Value,
    ) -> Result<(), String> {
        info!(destination, envelope_type, %envelope_data, %metadata, "publish");
        Ok(())
    }
}

/// Logs every applied event instead of updating a read model. Stands in
/// for a real projection function.
pub struct LoggingPerspectiveHandler {
    name: String,
}

impl LoggingPerspectiveHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl PerspectiveHandler for LoggingPerspectiveHandler {
    fn perspective_name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, event: &EventRow) -> Result<(), String> {
        info!(perspective = %self.name, event_id = %event.event_id, event_type = %event.event_type, "apply");
        Ok(())
    }
}

/// Logs every handled event instead of running a real side effect. Stands
/// in for a real receptor (an email send, a cache invalidation, ...).
pub struct LoggingReceptorHandler {
    name: String,
}

impl LoggingReceptorHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl ReceptorHandler for LoggingReceptorHandler {
    fn receptor_name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &EventRow) -> Result<(), String> {
        info!(receptor = %self.name, event_id = %event.event_id, event_type = %event.event_type, "handle");
        Ok(())
    }
}
