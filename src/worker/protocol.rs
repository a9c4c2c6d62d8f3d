//! Wire protocol between the pool and its workers.
//!
//! Messages are JSON objects tagged by `type`, one per line. A failed
//! computation is reported as two consecutive messages: an `error` marker
//! followed by a `failure` record, so the receiving side knows what the
//! next line holds before reading it.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Request from parent to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Arguments forwarded verbatim to `Kernel::process`.
    Args { payload: serde_json::Value },

    /// Stop the dispatch loop and exit.
    Shutdown,
}

/// Response from worker to parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Setup finished; the worker accepts requests.
    Ready,

    /// A computed value.
    Result { value: serde_json::Value },

    /// Error marker. Always followed by a `Failure` message.
    Error,

    /// Structured description of the error announced by the previous message.
    Failure(Failure),
}

/// Where in the worker lifecycle a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// `Kernel::setup` returned an error or panicked.
    Setup,
    /// `Kernel::process` returned an error.
    Compute,
    /// `Kernel::process` panicked.
    Panic,
    /// The request payload or the response value could not be (de)serialized.
    Protocol,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Setup => "setup",
            Self::Compute => "compute",
            Self::Panic => "panic",
            Self::Protocol => "protocol",
        };
        f.write_str(name)
    }
}

/// Failure information carried across the process boundary.
///
/// The live error value never crosses the boundary; only its rendered
/// message and the messages of its source chain do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub process_id: usize,
    pub kind: FailureKind,
    pub message: String,
    #[serde(default)]
    pub causes: Vec<String>,
}

impl Failure {
    /// Build a failure from an `anyhow` error, keeping its cause chain.
    pub fn from_error(process_id: usize, kind: FailureKind, error: &anyhow::Error) -> Self {
        Self {
            process_id,
            kind,
            message: error.to_string(),
            causes: error.chain().skip(1).map(|cause| cause.to_string()).collect(),
        }
    }

    /// Build a failure from a caught panic payload.
    pub fn from_panic(process_id: usize, kind: FailureKind, payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_string()
        };
        Self {
            process_id,
            kind,
            message,
            causes: Vec::new(),
        }
    }

    /// Build a protocol failure from a plain message.
    pub fn protocol(process_id: usize, message: impl Into<String>) -> Self {
        Self {
            process_id,
            kind: FailureKind::Protocol,
            message: message.into(),
            causes: Vec::new(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "worker {} {} failure: {}",
            self.process_id, self.kind, self.message
        )?;
        for cause in &self.causes {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for Failure {}

/// Marker standing in for a reply that was an error rather than a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorSentinel;

/// One worker's reply to a request as seen by an interface.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply<T> {
    Value(T),
    Error(ErrorSentinel),
}

impl<T> Reply<T> {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn value(self) -> Option<T> {
        match self {
            Self::Value(value) => Some(value),
            Self::Error(_) => None,
        }
    }
}

/// An `f64` that keeps its value on the wire even when it is not finite.
///
/// JSON has no literal for NaN or the infinities and `serde_json` writes
/// them as `null`. `Float` writes them as `"NaN"`, `"inf"` and `"-inf"`,
/// and reads numbers, those strings, or `null` (as NaN).
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct Float(pub f64);

impl From<f64> for Float {
    fn from(value: f64) -> Self {
        Self(value)
    }
}

impl From<Float> for f64 {
    fn from(value: Float) -> Self {
        value.0
    }
}

impl Serialize for Float {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let value = self.0;
        if value.is_finite() {
            serializer.serialize_f64(value)
        } else if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value > 0.0 {
            serializer.serialize_str("inf")
        } else {
            serializer.serialize_str("-inf")
        }
    }
}

impl<'de> Deserialize<'de> for Float {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(FloatVisitor)
    }
}

struct FloatVisitor;

impl<'de> Visitor<'de> for FloatVisitor {
    type Value = Float;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(r#"a number, "NaN", "inf", "-inf" or null"#)
    }

    fn visit_f64<E: de::Error>(self, value: f64) -> Result<Float, E> {
        Ok(Float(value))
    }

    fn visit_i64<E: de::Error>(self, value: i64) -> Result<Float, E> {
        Ok(Float(value as f64))
    }

    fn visit_u64<E: de::Error>(self, value: u64) -> Result<Float, E> {
        Ok(Float(value as f64))
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<Float, E> {
        match value {
            "NaN" | "nan" => Ok(Float(f64::NAN)),
            "inf" | "+inf" | "Infinity" => Ok(Float(f64::INFINITY)),
            "-inf" | "-Infinity" => Ok(Float(f64::NEG_INFINITY)),
            other => Err(E::invalid_value(de::Unexpected::Str(other), &self)),
        }
    }

    fn visit_unit<E: de::Error>(self) -> Result<Float, E> {
        Ok(Float(f64::NAN))
    }

    fn visit_none<E: de::Error>(self) -> Result<Float, E> {
        Ok(Float(f64::NAN))
    }
}
