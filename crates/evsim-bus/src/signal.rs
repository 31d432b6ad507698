//! Signal values, message snapshots and match expectations

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Label used by value tables for the "signal not available" raw value
pub const SNA_LABEL: &str = "SNA";

/// Physical value of a single signal
///
/// Serializes as a number or a string, with "not available" written as the
/// `SNA` label.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalValue {
    /// Scaled physical value
    Number(f64),
    /// Enumerated value (value table entry)
    Label(String),
    /// Signal not available (SNA)
    NotAvailable,
}

impl SignalValue {
    /// Create an enumerated value. `"SNA"` becomes [`SignalValue::NotAvailable`].
    pub fn label(label: impl Into<String>) -> Self {
        let label = label.into();
        if label == SNA_LABEL {
            Self::NotAvailable
        } else {
            Self::Label(label)
        }
    }

    /// Numeric value, if this is a concrete number
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(v) => Some(*v),
            _ => None,
        }
    }

    /// Label text, if this is an enumerated value
    pub fn as_label(&self) -> Option<&str> {
        match self {
            Self::Label(s) => Some(s),
            _ => None,
        }
    }

    /// Compare two values, tolerating float rounding from scale/offset
    pub fn matches(&self, other: &SignalValue) -> bool {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => (a - b).abs() < 1e-6,
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for SignalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(v) => write!(f, "{}", v),
            Self::Label(s) => f.write_str(s),
            Self::NotAvailable => f.write_str(SNA_LABEL),
        }
    }
}

impl From<f64> for SignalValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<u32> for SignalValue {
    fn from(v: u32) -> Self {
        Self::Number(v as f64)
    }
}

impl From<i32> for SignalValue {
    fn from(v: i32) -> Self {
        Self::Number(v as f64)
    }
}

impl From<&str> for SignalValue {
    fn from(s: &str) -> Self {
        Self::label(s)
    }
}

impl Serialize for SignalValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Number(value) => serializer.serialize_f64(*value),
            Self::Label(label) => serializer.serialize_str(label),
            Self::NotAvailable => serializer.serialize_str(SNA_LABEL),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawValue {
    Number(f64),
    Label(String),
}

impl<'de> Deserialize<'de> for SignalValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match RawValue::deserialize(deserializer)? {
            RawValue::Number(value) => Self::Number(value),
            RawValue::Label(label) => Self::label(label),
        })
    }
}

impl From<String> for SignalValue {
    fn from(s: String) -> Self {
        Self::label(s)
    }
}

/// Decoded signals of one received message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignalSnapshot {
    signals: BTreeMap<String, SignalValue>,
}

impl SignalSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, signal: impl Into<String>, value: impl Into<SignalValue>) -> Self {
        self.insert(signal, value);
        self
    }

    pub fn insert(&mut self, signal: impl Into<String>, value: impl Into<SignalValue>) {
        self.signals.insert(signal.into(), value.into());
    }

    pub fn get(&self, signal: &str) -> Option<&SignalValue> {
        self.signals.get(signal)
    }

    /// Concrete numeric value of a signal
    pub fn number(&self, signal: &str) -> Option<f64> {
        self.get(signal).and_then(SignalValue::as_f64)
    }

    /// Label of an enumerated signal
    pub fn label(&self, signal: &str) -> Option<&str> {
        self.get(signal).and_then(SignalValue::as_label)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &SignalValue)> {
        self.signals.iter()
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}

impl fmt::Display for SignalSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.signals.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", name, value)?;
        }
        f.write_str("}")
    }
}

/// Signal values a received message must carry to satisfy a wait
///
/// An empty expectation matches any instance of the message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Expectation {
    signals: BTreeMap<String, SignalValue>,
}

impl Expectation {
    /// Match any instance of the message
    pub fn any() -> Self {
        Self::default()
    }

    /// Match messages whose `signal` equals `value`
    pub fn signal(signal: impl Into<String>, value: impl Into<SignalValue>) -> Self {
        Self::any().and(signal, value)
    }

    /// Add another required signal value
    pub fn and(mut self, signal: impl Into<String>, value: impl Into<SignalValue>) -> Self {
        self.signals.insert(signal.into(), value.into());
        self
    }

    /// Check a snapshot against every required signal value
    pub fn matches(&self, snapshot: &SignalSnapshot) -> bool {
        self.signals.iter().all(|(name, expected)| {
            snapshot
                .get(name)
                .map(|actual| actual.matches(expected))
                .unwrap_or(false)
        })
    }
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.signals.is_empty() {
            return f.write_str("any");
        }
        for (i, (name, value)) in self.signals.iter().enumerate() {
            if i > 0 {
                f.write_str(" && ")?;
            }
            write!(f, "{} == {}", name, value)?;
        }
        Ok(())
    }
}
