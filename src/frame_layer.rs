use serde::Serialize;
use std::collections::VecDeque;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::field::{Field, Visit};
use tracing::Subscriber;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const RING_CAPACITY: usize = 1000;

// --- Protocol Log Entry ---
#[derive(Debug, Clone, Serialize)]
pub struct ProtocolLogEntry {
    pub id: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub level: String,
    pub message: String,
    pub breaker_id: Option<u64>,
}

// --- Raw MODBUS Frame Capture ---
#[derive(Debug, Clone, Serialize)]
pub struct RawFrame {
    pub id: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub direction: String, // "TX" or "RX"
    pub station: Option<u64>,
    pub data: Vec<u8>,
}

/// Recent frames and notable log lines, kept for the diagnostics endpoints.
#[derive(Clone)]
pub struct LogStore {
    pub logs: Arc<RwLock<VecDeque<ProtocolLogEntry>>>,
    pub log_counter: Arc<AtomicU64>,
    pub raw_frames: Arc<RwLock<VecDeque<RawFrame>>>,
    pub frame_counter: Arc<AtomicU64>,
}

impl LogStore {
    pub fn new() -> Self {
        Self {
            logs: Arc::new(RwLock::new(VecDeque::with_capacity(RING_CAPACITY))),
            log_counter: Arc::new(AtomicU64::new(0)),
            raw_frames: Arc::new(RwLock::new(VecDeque::with_capacity(RING_CAPACITY))),
            frame_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn frames_since(&self, after: Option<u64>) -> Vec<RawFrame> {
        let frames = self.raw_frames.read().await;
        frames
            .iter()
            .filter(|f| after.map_or(true, |a| f.id > a))
            .cloned()
            .collect()
    }

    pub async fn logs_since(&self, after: Option<u64>) -> Vec<ProtocolLogEntry> {
        let logs = self.logs.read().await;
        logs.iter()
            .filter(|l| after.map_or(true, |a| l.id > a))
            .cloned()
            .collect()
    }
}

impl Default for LogStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracing layer that copies the transport's TX/RX frames and the
/// warnings and connectivity events of this crate into a [`LogStore`].
pub struct FrameCaptureLayer {
    store: LogStore,
}

impl FrameCaptureLayer {
    pub fn new(store: LogStore) -> Self {
        Self { store }
    }
}

#[derive(Default)]
struct EventVisitor {
    message: String,
    direction: Option<String>,
    frame: Option<String>,
    station: Option<u64>,
    breaker_id: Option<u64>,
}

impl Visit for EventVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message.push_str(value),
            "direction" => self.direction = Some(value.to_string()),
            "frame" => self.frame = Some(value.to_string()),
            name => {
                write!(self.message, " {}={}", name, value).ok();
            }
        }
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        match field.name() {
            "station" => self.station = Some(value),
            "breaker_id" => self.breaker_id = Some(value),
            name => {
                write!(self.message, " {}={}", name, value).ok();
            }
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        match field.name() {
            "message" => {
                write!(self.message, "{:?}", value).ok();
            }
            "frame" => self.frame = Some(format!("{:?}", value)),
            "direction" => self.direction = Some(format!("{:?}", value).trim_matches('"').to_string()),
            name => {
                write!(self.message, " {}={:?}", name, value).ok();
            }
        }
    }
}

impl<S: Subscriber> Layer<S> for FrameCaptureLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if !metadata.target().starts_with(env!("CARGO_CRATE_NAME")) {
            return;
        }

        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);

        // 1. Frames logged by the transport
        if let (Some(direction), Some(hex)) = (&visitor.direction, &visitor.frame) {
            if let Some(data) = parse_adu(hex) {
                if let Ok(mut q) = self.store.raw_frames.try_write() {
                    if q.len() >= RING_CAPACITY {
                        q.pop_front();
                    }
                    q.push_back(RawFrame {
                        id: self.store.frame_counter.fetch_add(1, Ordering::Relaxed),
                        timestamp: chrono::Utc::now(),
                        direction: direction.clone(),
                        station: visitor.station,
                        data,
                    });
                }
            }
            return;
        }

        // 2. Warnings, errors and connectivity changes
        let level = *metadata.level();
        let lower = visitor.message.to_lowercase();
        let is_important = level <= tracing::Level::WARN
            || lower.contains("refused")
            || lower.contains("timed out")
            || lower.contains("unreachable")
            || lower.contains("gateway");
        if !is_important {
            return;
        }
        if let Ok(mut q) = self.store.logs.try_write() {
            if q.len() >= RING_CAPACITY {
                q.pop_front();
            }
            q.push_back(ProtocolLogEntry {
                id: self.store.log_counter.fetch_add(1, Ordering::Relaxed),
                timestamp: chrono::Utc::now(),
                level: level.to_string(),
                message: visitor.message,
                breaker_id: visitor.breaker_id,
            });
        }
    }
}

/// Parse "00 01 00 00 ..." back into bytes. Only well-formed MBAP frames
/// (protocol id 0, length field matching the byte count) are accepted.
fn parse_adu(hex: &str) -> Option<Vec<u8>> {
    let bytes = hex
        .split_whitespace()
        .map(|tok| u8::from_str_radix(tok, 16))
        .collect::<Result<Vec<u8>, _>>()
        .ok()?;
    if bytes.len() < 8 || bytes[2] != 0 || bytes[3] != 0 {
        return None;
    }
    let length = u16::from_be_bytes([bytes[4], bytes[5]]) as usize;
    (length == bytes.len() - 6).then_some(bytes)
}
