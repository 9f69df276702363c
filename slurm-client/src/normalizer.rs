//! Error normalizer
//!
//! Maps `(status, body)` of a failed wire call into a [`NormalizedError`]. Each
//! revision reports errors in a slightly different envelope; structured entries
//! win over the status fallback whenever at least one can be extracted.

use crate::error::{ErrorDetail, ErrorKind, NormalizedError};
use crate::version::ProtocolVersion;
use serde_json::Value;

/// Error envelope layout used by a revision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeShape {
    /// Top-level `errors[]` with `error_description`
    ErrorDescription,
    /// Top-level `errors[]` with `description`, or the same list under `meta`
    MetaNested,
    /// Top-level `errors[]` with `description`
    Description,
}

impl EnvelopeShape {
    pub fn for_version(version: ProtocolVersion) -> Self {
        if version <= ProtocolVersion::V0_0_40 {
            EnvelopeShape::ErrorDescription
        } else if version == ProtocolVersion::V0_0_41 {
            EnvelopeShape::MetaNested
        } else {
            EnvelopeShape::Description
        }
    }

    fn description_key(&self) -> &'static str {
        match self {
            EnvelopeShape::ErrorDescription => "error_description",
            EnvelopeShape::MetaNested | EnvelopeShape::Description => "description",
        }
    }
}

/// Per-revision normalizer owned by the adapter bound to that revision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorNormalizer {
    version: ProtocolVersion,
    shape: EnvelopeShape,
}

impl ErrorNormalizer {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            version,
            shape: EnvelopeShape::for_version(version),
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn shape(&self) -> EnvelopeShape {
        self.shape
    }

    /// `None` for 2xx, otherwise the normalized failure. Never panics on any body.
    pub fn normalize(&self, status: u16, body: &[u8], operation: &str) -> Option<NormalizedError> {
        if (200..300).contains(&status) {
            return None;
        }

        let details = self.extract_details(body);
        let error = if details.is_empty() {
            let body_text = String::from_utf8_lossy(body).into_owned();
            let detail = ErrorDetail::new(format!("HTTP_{}", status), "http", body_text);
            let kind = ErrorKind::from_status(status);
            NormalizedError::new(kind, Some(status), fallback_message(status))
                .with_details(vec![detail])
        } else {
            let message = match details.len() {
                1 => format!("API error: {}", details[0].description),
                n => format!("API error: {} (and {} more)", details[0].description, n - 1),
            };
            NormalizedError::new(ErrorKind::ApiError, Some(status), message).with_details(details)
        };

        Some(
            error
                .with_api_version(self.version.to_string())
                .with_operation(operation),
        )
    }

    fn extract_details(&self, body: &[u8]) -> Vec<ErrorDetail> {
        let Ok(envelope) = serde_json::from_slice::<Value>(body) else {
            return Vec::new();
        };

        let mut entries = envelope.get("errors").and_then(Value::as_array);
        if self.shape == EnvelopeShape::MetaNested && entries.map_or(true, |e| e.is_empty()) {
            entries = envelope
                .get("meta")
                .and_then(|meta| meta.get("errors"))
                .and_then(Value::as_array);
        }

        entries
            .into_iter()
            .flatten()
            .filter_map(|entry| self.detail_from_entry(entry))
            .collect()
    }

    fn detail_from_entry(&self, entry: &Value) -> Option<ErrorDetail> {
        let entry = entry.as_object()?;
        let error = text(entry.get("error"));
        let number = text(entry.get("error_number"));
        let description = text(entry.get(self.shape.description_key()));
        let source = text(entry.get("source")).unwrap_or_default();

        if error.is_none() && number.is_none() && description.is_none() {
            return None;
        }

        let code = error.clone().or_else(|| number.clone()).unwrap_or_default();
        let description = description
            .or(error)
            .or_else(|| number.map(|n| format!("error number {}", n)))
            .unwrap_or_default();

        Some(ErrorDetail::new(code, source, description))
    }
}

/// One-shot form of [`ErrorNormalizer::normalize`]
pub fn normalize(
    status: u16,
    body: &[u8],
    version: ProtocolVersion,
    operation: &str,
) -> Option<NormalizedError> {
    ErrorNormalizer::new(version).normalize(status, body, operation)
}

fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn fallback_message(status: u16) -> String {
    match status {
        401 => "authentication failed".to_string(),
        403 => "permission denied".to_string(),
        404 => "resource not found".to_string(),
        409 => "resource conflict".to_string(),
        422 => "request validation failed".to_string(),
        429 => "too many requests".to_string(),
        500 | 502 | 503 => "server error".to_string(),
        504 => "gateway timeout".to_string(),
        other => format!("unexpected HTTP status {}", other),
    }
}
