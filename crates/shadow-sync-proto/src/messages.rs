//! Shadow documents and their wire encoding.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The `state` section of a shadow document.
///
/// Update documents carry `desired` and/or `reported`; delta documents carry
/// the differing fields directly, which land in `fields`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShadowState {
    /// Desired state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired: Option<Value>,
    /// Reported state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported: Option<Value>,
    /// Remaining fields (the delta body on `update/delta`)
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// A device shadow document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShadowDocument {
    /// State section
    #[serde(default)]
    pub state: ShadowState,
    /// Correlation token echoed by the service
    #[serde(
        rename = "clientToken",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub client_token: Option<String>,
    /// Document version assigned by the service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    /// Service timestamp in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl ShadowDocument {
    /// Create a desired-state update.
    #[must_use]
    pub fn desired(state: Value, client_token: impl Into<String>) -> Self {
        Self {
            state: ShadowState {
                desired: Some(state),
                ..ShadowState::default()
            },
            client_token: Some(client_token.into()),
            ..Self::default()
        }
    }

    /// Create a reported-state update.
    #[must_use]
    pub fn reported(state: Value, client_token: impl Into<String>) -> Self {
        Self {
            state: ShadowState {
                reported: Some(state),
                ..ShadowState::default()
            },
            client_token: Some(client_token.into()),
            ..Self::default()
        }
    }

    /// The correlation token, read from the top level or, failing that,
    /// from inside `state`.
    #[must_use]
    pub fn client_token(&self) -> Option<&str> {
        self.client_token.as_deref().or_else(|| {
            self.state
                .fields
                .get("clientToken")
                .and_then(Value::as_str)
        })
    }

    /// The delta body of an `update/delta` document.
    #[must_use]
    pub fn delta(&self) -> Value {
        let mut fields = self.state.fields.clone();
        fields.remove("clientToken");
        Value::Object(fields)
    }
}

/// Payload published on `*/rejected` topics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP-style status code
    pub code: u16,
    /// Human readable reason
    #[serde(default)]
    pub message: String,
    /// Correlation token of the rejected request
    #[serde(
        rename = "clientToken",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub client_token: Option<String>,
    /// Service timestamp in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl ErrorResponse {
    /// Status code reported when no shadow document exists.
    pub const NOT_FOUND: u16 = 404;

    /// Whether the rejection only says there was no document.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.code == Self::NOT_FOUND
    }
}

/// Encodes and decodes shadow payloads.
pub trait DocumentCodec {
    /// Encode a document for publishing.
    ///
    /// # Errors
    ///
    /// Returns error if the document cannot be serialized.
    fn encode(&self, document: &ShadowDocument) -> Result<Vec<u8>, CodecError>;

    /// Decode an `update/*` or `delete/accepted` payload.
    ///
    /// # Errors
    ///
    /// Returns error if the payload is malformed.
    fn decode(&self, payload: &[u8]) -> Result<ShadowDocument, CodecError>;

    /// Decode a `*/rejected` payload.
    ///
    /// # Errors
    ///
    /// Returns error if the payload is malformed.
    fn decode_error(&self, payload: &[u8]) -> Result<ErrorResponse, CodecError>;
}

/// JSON codec used on the wire.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl DocumentCodec for JsonCodec {
    fn encode(&self, document: &ShadowDocument) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(document).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, payload: &[u8]) -> Result<ShadowDocument, CodecError> {
        // delete/accepted may arrive with an empty body
        if payload.is_empty() {
            return Ok(ShadowDocument::default());
        }
        serde_json::from_slice(payload).map_err(|e| CodecError::Decode(e.to_string()))
    }

    fn decode_error(&self, payload: &[u8]) -> Result<ErrorResponse, CodecError> {
        serde_json::from_slice(payload).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// Errors for document encoding/decoding.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CodecError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Encode(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Decode(String),
}
