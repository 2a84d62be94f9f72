use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::Settings;
use crate::consumer::EventHandler;
use crate::utils::error::HandlerError;

/// Default settings pointed at the in-memory transport, keeping the 5s reconnect delay.
pub fn memory_settings() -> Settings {
    let mut settings = Settings::default();
    settings.broker.url = "memory://test".to_string();
    settings.broker.reconnect_delay_ms = 5000;
    settings
}

/// Records every call; fails when `fail_with` is set.
#[derive(Default)]
pub struct RecordingHandler {
    pub calls: Mutex<Vec<(Value, String)>>,
    pub fail_with: Option<String>,
}

impl RecordingHandler {
    pub fn failing(reason: &str) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_with: Some(reason.to_string()),
        }
    }

    pub fn calls(&self) -> Vec<(Value, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, payload: Value, correlation_id: &str) -> Result<(), HandlerError> {
        self.calls
            .lock()
            .unwrap()
            .push((payload, correlation_id.to_string()));
        match &self.fail_with {
            Some(reason) => Err(HandlerError::failed(reason.clone())),
            None => Ok(()),
        }
    }
}

/// Polls `condition` every 10ms, up to 5s of (possibly paused) time.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub fn shared(handler: RecordingHandler) -> Arc<RecordingHandler> {
    Arc::new(handler)
}
