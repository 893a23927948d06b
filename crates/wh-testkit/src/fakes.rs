//! In-memory stand-ins for the `Transport`/`PerspectiveHandler`/`ReceptorHandler`
//! collaborators: a default collaborator a test can install to observe what
//! the coordination core handed it, without a real downstream system.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use wh_db::EventRow;
use wh_worker::{PerspectiveHandler, ReceptorHandler, Transport};

#[derive(Debug, Clone)]
pub struct RecordedPublish {
    pub destination: String,
    pub envelope_type: String,
    pub envelope_data: Value,
    pub metadata: Value,
}

/// Records every `publish` call it receives; optionally fails the next N
/// calls to exercise the publisher worker's retry path (S5).
pub struct RecordingTransport {
    published: Mutex<Vec<RecordedPublish>>,
    remaining_failures: Mutex<u32>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self { published: Mutex::new(Vec::new()), remaining_failures: Mutex::new(0) }
    }

    /// The next `n` calls to `publish` return `Err` instead of recording.
    pub fn fail_next(&self, n: u32) {
        *self.remaining_failures.lock().unwrap() = n;
    }

    pub fn published(&self) -> Vec<RecordedPublish> {
        self.published.lock().unwrap().clone()
    }
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn publish(&self, destination: &str, envelope_type: &str, envelope_data: &Value, metadata: &Value) -> Result<(), String> {
        let mut remaining = self.remaining_failures.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            return Err("transport refused".to_string());
        }
        drop(remaining);

        self.published.lock().unwrap().push(RecordedPublish {
            destination: destination.to_string(),
            envelope_type: envelope_type.to_string(),
            envelope_data: envelope_data.clone(),
            metadata: metadata.clone(),
        });
        Ok(())
    }
}

/// Records every event handed to `apply`, in the order received, so a test
/// can assert the perspective worker replayed a stream strictly in order
/// (S6).
pub struct RecordingPerspectiveHandler {
    name: String,
    applied: Mutex<Vec<EventRow>>,
}

impl RecordingPerspectiveHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), applied: Mutex::new(Vec::new()) }
    }

    pub fn applied_event_ids(&self) -> Vec<uuid::Uuid> {
        self.applied.lock().unwrap().iter().map(|e| e.event_id).collect()
    }
}

#[async_trait]
impl PerspectiveHandler for RecordingPerspectiveHandler {
    fn perspective_name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, event: &EventRow) -> Result<(), String> {
        self.applied.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Records every event handed to `handle` and how many times each
/// `event_id` was seen, so a test can assert a receptor is invoked exactly
/// once per event even under duplicate delivery (property 2).
pub struct RecordingReceptorHandler {
    name: String,
    handled: Mutex<Vec<uuid::Uuid>>,
}

impl RecordingReceptorHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), handled: Mutex::new(Vec::new()) }
    }

    pub fn handled_event_ids(&self) -> Vec<uuid::Uuid> {
        self.handled.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReceptorHandler for RecordingReceptorHandler {
    fn receptor_name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &EventRow) -> Result<(), String> {
        self.handled.lock().unwrap().push(event.event_id);
        Ok(())
    }
}
