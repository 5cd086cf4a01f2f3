//! Link property model
//!
//! [`LinkModel`] is the canonical, comparable snapshot of a link's traffic
//! properties: exactly five optional fields, where `None` means
//! "unconstrained". Equality and serialization cover only these fields.
//!
//! [`LinkModelCell`] wraps a model with change notification: every setter
//! fires registered callbacks with `(property_name, new_value)`. Runtime-only
//! attachments (subscriber closures) never affect equality and never appear
//! in a persisted snapshot.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Snapshot of the five canonical link properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkModel {
    pub bandwidth_bits_per_second: Option<u64>,
    pub delay_ms: Option<u64>,
    pub jitter_ms: Option<u64>,
    pub packet_loss_percent: Option<f64>,
    pub bit_error_rate: Option<f64>,
}

impl LinkModel {
    pub fn is_unconstrained(&self) -> bool {
        *self == LinkModel::default()
    }

    pub fn bandwidth_mbps(&self) -> Option<f64> {
        self.bandwidth_bits_per_second
            .map(|bps| bps as f64 / 1_000_000.0)
    }
}

/// Parse a bandwidth string like `10Mbps`, `500kbps` or `1gbps` into bits
/// per second. An empty string defaults to 1 Gbps.
pub fn parse_bandwidth(input: &str) -> Option<u64> {
    if input.is_empty() {
        return Some(1_000_000_000);
    }
    let digits: String = input.chars().take_while(|c| c.is_ascii_digit()).collect();
    let unit = input[digits.len()..].trim().to_ascii_lowercase();
    let value: u64 = digits.parse().ok()?;
    let scale = match unit.as_str() {
        "bps" => 1,
        "kbps" => 1_000,
        "mbps" => 1_000_000,
        "gbps" => 1_000_000_000,
        _ => return None,
    };
    Some(value * scale)
}

/// Parse a timespan like `5ms`, `1.5s` or `250us` into milliseconds.
pub fn parse_timespan_ms(input: &str) -> Option<u64> {
    let trimmed = input.trim();
    let split = trimmed.find(|c: char| c.is_ascii_alphabetic())?;
    let value: f64 = trimmed[..split].parse().ok()?;
    let factor = match &trimmed[split..] {
        "us" => 0.001,
        "ms" => 1.0,
        "s" => 1000.0,
        "m" | "min" => 60_000.0,
        _ => return None,
    };
    Some((value * factor) as u64)
}

/// Parse a percentage like `0.1%` or `5`. An empty string means zero.
pub fn parse_percent(input: &str) -> Option<f64> {
    if input.is_empty() {
        return Some(0.0);
    }
    input.trim().trim_end_matches('%').trim().parse().ok()
}

type ChangeCallback = Box<dyn Fn(&str, serde_json::Value) + Send + Sync>;

/// Mutable link model with change notification.
#[derive(Clone, Default)]
pub struct LinkModelCell {
    inner: Arc<Mutex<LinkModel>>,
    callbacks: Arc<Mutex<Vec<ChangeCallback>>>,
}

impl LinkModelCell {
    pub fn new(model: LinkModel) -> Self {
        Self {
            inner: Arc::new(Mutex::new(model)),
            callbacks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Current snapshot of the five canonical fields.
    pub fn snapshot(&self) -> LinkModel {
        self.inner.lock().clone()
    }

    /// Register a callback fired on every property change.
    pub fn on_change(&self, callback: impl Fn(&str, serde_json::Value) + Send + Sync + 'static) {
        self.callbacks.lock().push(Box::new(callback));
    }

    fn fire(&self, property: &str, value: serde_json::Value) {
        // Callbacks run without the model lock held; a subscriber may read
        // the snapshot again.
        let callbacks = self.callbacks.lock();
        for callback in callbacks.iter() {
            callback(property, value.clone());
        }
    }

    pub fn set_bandwidth_bits_per_second(&self, bandwidth: Option<u64>) {
        self.inner.lock().bandwidth_bits_per_second = bandwidth;
        self.fire("bandwidth_bits_per_second", serde_json::json!(bandwidth));
    }

    pub fn set_delay_ms(&self, delay: Option<u64>) {
        self.inner.lock().delay_ms = delay;
        self.fire("delay_ms", serde_json::json!(delay));
    }

    pub fn set_jitter_ms(&self, jitter: Option<u64>) {
        self.inner.lock().jitter_ms = jitter;
        self.fire("jitter_ms", serde_json::json!(jitter));
    }

    pub fn set_packet_loss_percent(&self, loss: Option<f64>) {
        self.inner.lock().packet_loss_percent = loss;
        self.fire("packet_loss_percent", serde_json::json!(loss));
    }

    pub fn set_bit_error_rate(&self, ber: Option<f64>) {
        self.inner.lock().bit_error_rate = ber;
        self.fire("bit_error_rate", serde_json::json!(ber));
    }

    /// String setters used by external topology loaders.
    pub fn set_bandwidth_from_string(&self, input: &str) {
        if let Some(bps) = parse_bandwidth(input) {
            self.set_bandwidth_bits_per_second(Some(bps));
        }
    }

    pub fn set_delay_from_timespan(&self, input: &str) {
        if let Some(ms) = parse_timespan_ms(input) {
            self.set_delay_ms(Some(ms));
        }
    }

    pub fn set_jitter_from_timespan(&self, input: &str) {
        if let Some(ms) = parse_timespan_ms(input) {
            self.set_jitter_ms(Some(ms));
        }
    }

    pub fn set_packet_loss_from_string(&self, input: &str) {
        if let Some(pct) = parse_percent(input) {
            self.set_packet_loss_percent(Some(pct));
        }
    }
}

impl std::fmt::Debug for LinkModelCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("LinkModelCell").field(&self.snapshot()).finish()
    }
}

impl PartialEq for LinkModelCell {
    fn eq(&self, other: &Self) -> bool {
        self.snapshot() == other.snapshot()
    }
}
