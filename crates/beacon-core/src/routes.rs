//! Topic route table.
//!
//! Routes are bound once at startup and resolved on every message:
//!
//! - **outbound**: message type -> (topic, serializer), used when pushing to clients
//! - **inbound**: topic -> (message type, deserializer, handler type), used when
//!   dispatching client commands
//!
//! Bindings are validated as they are made, so a bad table fails at startup
//! rather than on the first message.

use crate::config::ConfigError;
use crate::dispatch::CommandHandler;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Maximum topic name length.
pub const MAX_TOPIC_LENGTH: usize = 256;

/// Boxed error returned by serializers, deserializers and handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type SerializeFn = Box<dyn Fn(&dyn Any) -> Result<String, BoxError> + Send + Sync>;
type DecodeFn = Box<dyn Fn(&str) -> Result<Box<dyn Any + Send + Sync>, BoxError> + Send + Sync>;

/// Route resolution errors.
#[derive(Debug, Error)]
pub enum RouteError {
    /// The message type was never bound to an outbound topic.
    #[error("No outbound route for message type {0}")]
    OutboundNotFound(&'static str),

    /// The topic was never bound to an inbound route.
    #[error("No inbound route for topic {0:?}")]
    InboundNotFound(String),
}

/// Validate a topic name.
///
/// # Errors
///
/// Returns an error message if the topic name is invalid.
pub fn validate_topic(topic: &str) -> Result<(), &'static str> {
    if topic.is_empty() {
        return Err("Topic cannot be empty");
    }
    if topic.len() > MAX_TOPIC_LENGTH {
        return Err("Topic too long");
    }
    if topic.starts_with('$') {
        return Err("Topics starting with '$' are reserved");
    }
    if !topic.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Topic contains invalid characters");
    }
    Ok(())
}

fn checked_topic(topic: impl Into<String>) -> Result<String, ConfigError> {
    let topic = topic.into();
    validate_topic(&topic).map_err(|reason| ConfigError::InvalidTopic {
        topic: topic.clone(),
        reason,
    })?;
    Ok(topic)
}

/// A message type bound to an outbound topic.
pub struct OutboundRoute {
    message_type: &'static str,
    topic: String,
    serialize: SerializeFn,
}

impl OutboundRoute {
    /// The bound message type name.
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        self.message_type
    }

    /// The topic messages are pushed to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Serialize a message of the bound type.
    ///
    /// # Errors
    ///
    /// Returns the serializer's error, or an error if `message` is not of the
    /// bound type.
    pub fn serialize<M: Any>(&self, message: &M) -> Result<String, BoxError> {
        (self.serialize)(message)
    }
}

impl fmt::Debug for OutboundRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundRoute")
            .field("message_type", &self.message_type)
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

/// A topic bound to a message type and its handler.
pub struct InboundRoute {
    topic: String,
    message_type: &'static str,
    message_type_id: TypeId,
    handler_type: &'static str,
    decode: DecodeFn,
}

impl InboundRoute {
    /// The bound topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The decoded message type name.
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        self.message_type
    }

    /// The decoded message type.
    #[must_use]
    pub fn message_type_id(&self) -> TypeId {
        self.message_type_id
    }

    /// The handler type declared for this topic.
    #[must_use]
    pub fn handler_type(&self) -> &'static str {
        self.handler_type
    }

    /// Decode a raw payload into the bound message type.
    ///
    /// # Errors
    ///
    /// Returns the deserializer's error.
    pub fn decode(&self, raw: &str) -> Result<Box<dyn Any + Send + Sync>, BoxError> {
        (self.decode)(raw)
    }
}

impl fmt::Debug for InboundRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundRoute")
            .field("topic", &self.topic)
            .field("message_type", &self.message_type)
            .field("handler_type", &self.handler_type)
            .finish_non_exhaustive()
    }
}

/// Per-endpoint route configuration.
#[derive(Debug, Default)]
pub struct TopicRouteTable {
    /// Outbound routes keyed by message type.
    outbound: HashMap<TypeId, OutboundRoute>,
    /// Inbound routes keyed by topic.
    inbound: HashMap<String, InboundRoute>,
}

impl TopicRouteTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind message type `M` to an outbound topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic is invalid or `M` is already bound.
    pub fn bind_outbound<M, F>(
        &mut self,
        topic: impl Into<String>,
        serializer: F,
    ) -> Result<&mut Self, ConfigError>
    where
        M: Any,
        F: Fn(&M) -> Result<String, BoxError> + Send + Sync + 'static,
    {
        let topic = checked_topic(topic)?;
        let message_type = type_name::<M>();

        if self.outbound.contains_key(&TypeId::of::<M>()) {
            return Err(ConfigError::DuplicateOutbound(message_type));
        }

        let serialize: SerializeFn = Box::new(move |message: &dyn Any| {
            let message = message
                .downcast_ref::<M>()
                .ok_or_else(|| format!("expected a {message_type}"))?;
            serializer(message)
        });

        debug!(message_type, topic = %topic, "Bound outbound route");
        self.outbound.insert(
            TypeId::of::<M>(),
            OutboundRoute {
                message_type,
                topic,
                serialize,
            },
        );
        Ok(self)
    }

    /// Bind message type `M` to an outbound topic, serialized as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic is invalid or `M` is already bound.
    pub fn bind_outbound_json<M>(&mut self, topic: impl Into<String>) -> Result<&mut Self, ConfigError>
    where
        M: Serialize + Any,
    {
        self.bind_outbound::<M, _>(topic, |message| Ok(serde_json::to_string(message)?))
    }

    /// Bind an inbound topic to message type `M`, handled by `H`.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic is invalid or already bound.
    pub fn bind_inbound<M, H, F>(
        &mut self,
        topic: impl Into<String>,
        deserializer: F,
    ) -> Result<&mut Self, ConfigError>
    where
        M: Send + Sync + 'static,
        H: CommandHandler<M>,
        F: Fn(&str) -> Result<M, BoxError> + Send + Sync + 'static,
    {
        let topic = checked_topic(topic)?;

        if self.inbound.contains_key(&topic) {
            return Err(ConfigError::DuplicateInbound(topic));
        }

        let decode: DecodeFn = Box::new(move |raw: &str| {
            let message = deserializer(raw)?;
            Ok(Box::new(message) as Box<dyn Any + Send + Sync>)
        });

        let route = InboundRoute {
            topic: topic.clone(),
            message_type: type_name::<M>(),
            message_type_id: TypeId::of::<M>(),
            handler_type: type_name::<H>(),
            decode,
        };

        debug!(
            topic = %topic,
            message_type = route.message_type,
            handler_type = route.handler_type,
            "Bound inbound route"
        );
        self.inbound.insert(topic, route);
        Ok(self)
    }

    /// Bind an inbound topic to message type `M` decoded from JSON, handled by `H`.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic is invalid or already bound.
    pub fn bind_inbound_json<M, H>(&mut self, topic: impl Into<String>) -> Result<&mut Self, ConfigError>
    where
        M: DeserializeOwned + Send + Sync + 'static,
        H: CommandHandler<M>,
    {
        self.bind_inbound::<M, H, _>(topic, |raw| Ok(serde_json::from_str(raw)?))
    }

    /// Resolve the outbound route of message type `M`.
    ///
    /// # Errors
    ///
    /// Returns an error if `M` was never bound.
    pub fn resolve_outbound<M: Any>(&self) -> Result<&OutboundRoute, RouteError> {
        self.outbound
            .get(&TypeId::of::<M>())
            .ok_or(RouteError::OutboundNotFound(type_name::<M>()))
    }

    /// Resolve the inbound route of a topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic was never bound.
    pub fn resolve_inbound(&self, topic: &str) -> Result<&InboundRoute, RouteError> {
        self.inbound
            .get(topic)
            .ok_or_else(|| RouteError::InboundNotFound(topic.to_string()))
    }

    /// Iterate over inbound routes.
    pub fn inbound_routes(&self) -> impl Iterator<Item = &InboundRoute> {
        self.inbound.values()
    }

    /// Number of outbound routes.
    #[must_use]
    pub fn outbound_count(&self) -> usize {
        self.outbound.len()
    }

    /// Number of inbound routes.
    #[must_use]
    pub fn inbound_count(&self) -> usize {
        self.inbound.len()
    }
}
