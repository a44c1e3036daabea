//! MQTT topic grammar for device shadows.
//!
//! Topic structure: `$aws/things/{thing}/shadow[/name/{shadow}]/{op}[/{sub}]`
//!
//! Classic shadows omit the `/name/{shadow}` segment. Classification is
//! purely syntactic and total: anything outside the grammar is `NotShadow`.

use serde::{Deserialize, Serialize};

/// Leading segments shared by every shadow topic.
pub const TOPIC_PREFIX: &str = "$aws/things/";

/// Maximum thing name length accepted by AWS IoT.
pub const THING_NAME_MAX_LENGTH: usize = 128;

/// Maximum named shadow length accepted by AWS IoT.
pub const SHADOW_NAME_MAX_LENGTH: usize = 64;

/// Length bounds applied to identifier segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicLimits {
    /// Maximum thing name length in bytes
    pub max_thing_len: usize,
    /// Maximum shadow name length in bytes
    pub max_shadow_len: usize,
}

impl Default for TopicLimits {
    fn default() -> Self {
        Self {
            max_thing_len: THING_NAME_MAX_LENGTH,
            max_shadow_len: SHADOW_NAME_MAX_LENGTH,
        }
    }
}

/// The concrete topics of a single shadow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    /// `update`, publish target for desired/reported documents
    Update,
    /// `update/delta`
    UpdateDelta,
    /// `update/accepted`
    UpdateAccepted,
    /// `update/rejected`
    UpdateRejected,
    /// `delete`, publish target for delete requests
    Delete,
    /// `delete/accepted`
    DeleteAccepted,
    /// `delete/rejected`
    DeleteRejected,
}

impl TopicKind {
    /// All topic kinds, publish topics included.
    pub const ALL: [Self; 7] = [
        Self::Update,
        Self::UpdateDelta,
        Self::UpdateAccepted,
        Self::UpdateRejected,
        Self::Delete,
        Self::DeleteAccepted,
        Self::DeleteRejected,
    ];

    /// Topic suffix following the `shadow[/name/{shadow}]/` segment.
    #[must_use]
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::UpdateDelta => "update/delta",
            Self::UpdateAccepted => "update/accepted",
            Self::UpdateRejected => "update/rejected",
            Self::Delete => "delete",
            Self::DeleteAccepted => "delete/accepted",
            Self::DeleteRejected => "delete/rejected",
        }
    }

    /// Parse a topic suffix.
    #[must_use]
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.suffix() == suffix)
    }

    /// Message type delivered on this topic; publish topics are never delivered.
    #[must_use]
    pub fn message_type(self) -> MessageType {
        match self {
            Self::UpdateDelta => MessageType::UpdateDelta,
            Self::UpdateAccepted => MessageType::UpdateAccepted,
            Self::UpdateRejected => MessageType::UpdateRejected,
            Self::DeleteAccepted => MessageType::DeleteAccepted,
            Self::DeleteRejected => MessageType::DeleteRejected,
            Self::Update | Self::Delete => MessageType::NotShadow,
        }
    }
}

/// Classified type of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// `delete/accepted`
    DeleteAccepted,
    /// `delete/rejected`
    DeleteRejected,
    /// `update/delta`
    UpdateDelta,
    /// `update/accepted`
    UpdateAccepted,
    /// `update/rejected`
    UpdateRejected,
    /// Anything outside the shadow grammar
    NotShadow,
}

/// Result of classifying a topic string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMatch {
    /// Classified message type
    pub message_type: MessageType,
    /// Thing name, absent for `NotShadow`
    pub thing_name: Option<String>,
    /// Shadow name, absent for classic shadows and `NotShadow`
    pub shadow_name: Option<String>,
}

impl TopicMatch {
    fn not_shadow() -> Self {
        Self {
            message_type: MessageType::NotShadow,
            thing_name: None,
            shadow_name: None,
        }
    }
}

/// A classified inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowMessage {
    /// Classified message type
    pub message_type: MessageType,
    /// Thing name, absent for `NotShadow`
    pub thing_name: Option<String>,
    /// Shadow name, absent for classic shadows and `NotShadow`
    pub shadow_name: Option<String>,
    /// Raw payload
    pub payload: Vec<u8>,
}

/// Classifies topic strings against the shadow grammar.
#[derive(Debug, Clone, Copy, Default)]
pub struct TopicRouter {
    limits: TopicLimits,
}

impl TopicRouter {
    /// Create a router with the given identifier bounds.
    #[must_use]
    pub fn new(limits: TopicLimits) -> Self {
        Self { limits }
    }

    /// Identifier bounds in use.
    #[must_use]
    pub fn limits(&self) -> TopicLimits {
        self.limits
    }

    /// Classify a topic.
    ///
    /// Never fails: topics outside the grammar, or with an identifier
    /// exceeding the configured bound, yield `NotShadow`.
    #[must_use]
    pub fn classify(&self, topic: &str) -> TopicMatch {
        self.try_classify(topic)
            .unwrap_or_else(TopicMatch::not_shadow)
    }

    /// Classify a topic and attach the payload.
    #[must_use]
    pub fn route(&self, topic: &str, payload: &[u8]) -> ShadowMessage {
        let TopicMatch {
            message_type,
            thing_name,
            shadow_name,
        } = self.classify(topic);

        ShadowMessage {
            message_type,
            thing_name,
            shadow_name,
            payload: payload.to_vec(),
        }
    }

    fn try_classify(&self, topic: &str) -> Option<TopicMatch> {
        let remainder = topic.strip_prefix(TOPIC_PREFIX)?;

        let (thing, remainder) = remainder.split_once('/')?;
        validate_identifier(thing, self.limits.max_thing_len).ok()?;

        let remainder = remainder.strip_prefix("shadow")?;
        let (shadow, suffix) = if let Some(named) = remainder.strip_prefix("/name/") {
            let (shadow, suffix) = named.split_once('/')?;
            validate_identifier(shadow, self.limits.max_shadow_len).ok()?;
            (Some(shadow), suffix)
        } else {
            (None, remainder.strip_prefix('/')?)
        };

        let message_type = TopicKind::from_suffix(suffix)?.message_type();
        if message_type == MessageType::NotShadow {
            return None;
        }

        Some(TopicMatch {
            message_type,
            thing_name: Some(thing.to_string()),
            shadow_name: shadow.map(str::to_string),
        })
    }
}

/// Topic builder for one shadow of one thing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowTopics {
    thing_name: String,
    shadow_name: Option<String>,
    #[serde(default)]
    limits: TopicLimits,
}

impl ShadowTopics {
    /// Create a topic builder with the default AWS IoT limits.
    ///
    /// # Errors
    ///
    /// Returns error if an identifier is empty, too long, or contains
    /// `/`, whitespace or an MQTT wildcard.
    pub fn new(thing_name: &str, shadow_name: Option<&str>) -> Result<Self, TopicError> {
        Self::with_limits(thing_name, shadow_name, TopicLimits::default())
    }

    /// Create a topic builder with explicit identifier bounds.
    ///
    /// # Errors
    ///
    /// Returns error if an identifier violates `limits` or the character rules.
    pub fn with_limits(
        thing_name: &str,
        shadow_name: Option<&str>,
        limits: TopicLimits,
    ) -> Result<Self, TopicError> {
        validate_identifier(thing_name, limits.max_thing_len)?;
        if let Some(shadow) = shadow_name {
            validate_identifier(shadow, limits.max_shadow_len)?;
        }

        Ok(Self {
            thing_name: thing_name.to_string(),
            shadow_name: shadow_name.map(str::to_string),
            limits,
        })
    }

    /// Bounds the identifiers were validated against. Routers classifying
    /// this shadow's traffic must use the same bounds.
    #[must_use]
    pub fn limits(&self) -> TopicLimits {
        self.limits
    }

    /// Thing name.
    #[must_use]
    pub fn thing_name(&self) -> &str {
        &self.thing_name
    }

    /// Shadow name, `None` for the classic shadow.
    #[must_use]
    pub fn shadow_name(&self) -> Option<&str> {
        self.shadow_name.as_deref()
    }

    /// Build the base topic path.
    fn base(&self) -> String {
        match &self.shadow_name {
            Some(shadow) => format!("{TOPIC_PREFIX}{}/shadow/name/{shadow}", self.thing_name),
            None => format!("{TOPIC_PREFIX}{}/shadow", self.thing_name),
        }
    }

    /// Render the topic of the given kind.
    #[must_use]
    pub fn topic(&self, kind: TopicKind) -> String {
        format!("{}/{}", self.base(), kind.suffix())
    }

    /// Whether a classified message addresses this shadow.
    #[must_use]
    pub fn matches(&self, thing_name: Option<&str>, shadow_name: Option<&str>) -> bool {
        thing_name == Some(self.thing_name.as_str()) && shadow_name == self.shadow_name()
    }
}

fn validate_identifier(value: &str, max_len: usize) -> Result<(), TopicError> {
    if value.is_empty() {
        return Err(TopicError::EmptyIdentifier);
    }
    if value.len() > max_len {
        return Err(TopicError::IdentifierTooLong {
            len: value.len(),
            max: max_len,
        });
    }
    if let Some(ch) = value
        .chars()
        .find(|ch| *ch == '/' || *ch == '+' || *ch == '#' || ch.is_whitespace())
    {
        return Err(TopicError::InvalidCharacter(ch));
    }
    Ok(())
}

/// Errors building shadow topics.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    /// Identifier is empty
    #[error("identifier must not be empty")]
    EmptyIdentifier,
    /// Identifier exceeds the configured bound
    #[error("identifier is {len} bytes, maximum is {max}")]
    IdentifierTooLong {
        /// Identifier length
        len: usize,
        /// Configured bound
        max: usize,
    },
    /// Identifier contains a forbidden character
    #[error("identifier contains forbidden character {0:?}")]
    InvalidCharacter(char),
}
