//! Outbound payload sink.
//!
//! The core never serializes or transmits; it only fills the outbound queue.
//! This module drains that queue on a Tokio task and hands each item to the
//! registered sinks. The bundled [`JsonlSink`] appends one JSON line per
//! payload to a file, resolving raw-data handles to their string content on
//! the way out and releasing the use counts the engine pinned for upload.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Notify};

use vesper_common::{SenderData, SignalValue};

use crate::queue::BoundedQueue;
use crate::rawbuf::{RawBufferManager, UsageStage};

#[async_trait]
pub trait DataSink: Send + Sync {
    fn name(&self) -> &'static str;
    async fn process(&self, data: &SenderData);
}

pub struct SinkList {
    sinks: Vec<Arc<dyn DataSink>>,
}

impl Default for SinkList {
    fn default() -> Self {
        Self::new()
    }
}

impl SinkList {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn register<S: DataSink + 'static>(&mut self, sink: S) {
        self.sinks.push(Arc::new(sink));
    }

    pub async fn process(&self, data: &SenderData) {
        for sink in &self.sinks {
            sink.process(data).await;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

/// Spawn the sender task draining the outbound queue into the sinks.
pub fn spawn_sender(
    queue: Arc<BoundedQueue<SenderData>>,
    sinks: Arc<SinkList>,
) -> tokio::task::JoinHandle<()> {
    let notify = Arc::new(Notify::new());
    {
        let notify = Arc::clone(&notify);
        queue.subscribe_new_data(move || notify.notify_one());
    }
    tokio::spawn(async move {
        loop {
            while let Some(data) = queue.pop() {
                sinks.process(&data).await;
            }
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }
    })
}

/// Writes each payload as one JSON line.
pub struct JsonlSink {
    file: Mutex<tokio::fs::File>,
    raw_buffer_manager: Option<Arc<RawBufferManager>>,
}

impl JsonlSink {
    pub async fn new(
        path: &str,
        raw_buffer_manager: Option<Arc<RawBufferManager>>,
    ) -> std::io::Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self {
            file: Mutex::new(file),
            raw_buffer_manager,
        })
    }

    /// JSON rendition of the payload with raw handles resolved to strings.
    /// Resolving releases the upload pins, so this is called exactly once
    /// per payload.
    fn render(&self, data: &SenderData) -> Value {
        let mut value = serde_json::to_value(data).unwrap_or(Value::Null);
        if let (SenderData::Telemetry(payload), Some(manager)) =
            (data, self.raw_buffer_manager.as_deref())
        {
            let rendered_signals: Vec<Value> = payload
                .signals
                .iter()
                .map(|signal| {
                    let mut rendered = serde_json::to_value(signal).unwrap_or(Value::Null);
                    if let SignalValue::RawHandle(handle) = signal.value {
                        manager.increase_usage(signal.signal_id, handle, UsageStage::Uploading);
                        manager.decrease_usage(
                            signal.signal_id,
                            handle,
                            UsageStage::SelectedForUpload,
                        );
                        rendered["value"] = match manager.borrow(signal.signal_id, handle) {
                            Some(bytes) => {
                                Value::String(String::from_utf8_lossy(&bytes).into_owned())
                            }
                            None => Value::Null,
                        };
                        manager.decrease_usage(signal.signal_id, handle, UsageStage::Uploading);
                    }
                    rendered
                })
                .collect();
            value["signals"] = Value::Array(rendered_signals);
        }
        value
    }
}

#[async_trait]
impl DataSink for JsonlSink {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    async fn process(&self, data: &SenderData) {
        let line = self.render(data).to_string();
        let mut file = self.file.lock().await;
        if let Err(error) = file.write_all(line.as_bytes()).await {
            warn!("payload write failed: {}", error);
            return;
        }
        if let Err(error) = file.write_all(b"\n").await {
            warn!("payload newline write failed: {}", error);
            return;
        }
        if let Err(error) = file.flush().await {
            warn!("payload flush failed: {}", error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawBufConfig;
    use bytes::Bytes;
    use vesper_common::{PayloadSignal, SignalType, TriggeredPayload};

    #[tokio::test]
    async fn jsonl_writes_lines() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let sink = JsonlSink::new(file.path().to_str().unwrap(), None)
            .await
            .unwrap();
        let payload = SenderData::Telemetry(TriggeredPayload {
            scheme_id: "s".to_string(),
            event_id: 1,
            trigger_time_ms: 2,
            signals: vec![PayloadSignal {
                signal_id: 3,
                timestamp_ms: 2,
                value: SignalValue::Float64(4.5),
                signal_type: SignalType::Float64,
            }],
            active_dtcs: None,
        });
        sink.process(&payload).await;
        sink.process(&payload).await;
        let content = tokio::fs::read_to_string(file.path()).await.unwrap();
        assert_eq!(content.lines().count(), 2);
        let parsed: Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(parsed["kind"], "telemetry");
        assert_eq!(parsed["scheme_id"], "s");
    }

    #[tokio::test]
    async fn handles_resolve_to_strings_and_release_pins() {
        let manager = Arc::new(RawBufferManager::new(&RawBufConfig::default()));
        let handle = manager.push(9, Bytes::from_static(b"vin-123"), 0);
        manager.increase_usage(9, handle, UsageStage::SelectedForUpload);

        let file = tempfile::NamedTempFile::new().unwrap();
        let sink = JsonlSink::new(file.path().to_str().unwrap(), Some(Arc::clone(&manager)))
            .await
            .unwrap();
        let payload = SenderData::Telemetry(TriggeredPayload {
            scheme_id: "s".to_string(),
            event_id: 1,
            trigger_time_ms: 2,
            signals: vec![PayloadSignal {
                signal_id: 9,
                timestamp_ms: 2,
                value: SignalValue::RawHandle(handle),
                signal_type: SignalType::String,
            }],
            active_dtcs: None,
        });
        sink.process(&payload).await;

        let content = tokio::fs::read_to_string(file.path()).await.unwrap();
        let parsed: Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(parsed["signals"][0]["value"], "vin-123");
        // All pins released: the entry is reclaimable again.
        assert_eq!(manager.usage_count(9, handle, UsageStage::SelectedForUpload), 0);
        assert_eq!(manager.usage_count(9, handle, UsageStage::Uploading), 0);
    }

    #[tokio::test]
    async fn sender_task_drains_the_queue() {
        let queue = Arc::new(BoundedQueue::new(16, "out"));
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut sinks = SinkList::new();
        sinks.register(
            JsonlSink::new(file.path().to_str().unwrap(), None)
                .await
                .unwrap(),
        );
        let handle = spawn_sender(Arc::clone(&queue), Arc::new(sinks));

        queue.push(SenderData::CommandResponse(vesper_common::CommandResponse {
            command_id: "c".to_string(),
            status: vesper_common::CommandStatus::Succeeded,
            reason_code: 0,
            reason_description: String::new(),
        }));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            let content = tokio::fs::read_to_string(file.path()).await.unwrap();
            if content.lines().count() == 1 {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "timed out");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
    }
}
