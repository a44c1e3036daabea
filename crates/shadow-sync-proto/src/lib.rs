//! # Shadow Sync Protocol
//!
//! Topic grammar and document model for AWS IoT style device shadows.
//!
//! ## Topics
//!
//! Topic scheme: `$aws/things/{thing}/shadow[/name/{shadow}]/{op}[/{sub}]`
//!
//! - `op` is `update` or `delete`
//! - `sub` is `delta`, `accepted` or `rejected` (absent on the publish topics)
//!
//! ## Documents
//!
//! - `ShadowDocument`: `{state: {desired?, reported?}, clientToken?, version?}`
//! - `ErrorResponse`: payload of the `*/rejected` topics

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod messages;
pub mod topics;

pub use messages::{
    CodecError, DocumentCodec, ErrorResponse, JsonCodec, ShadowDocument, ShadowState,
};
pub use topics::{
    MessageType, ShadowMessage, ShadowTopics, TopicError, TopicKind, TopicLimits, TopicMatch,
    TopicRouter,
};
