//! Inbound command dispatch.
//!
//! A command arrives as `(topic, raw payload)`. The dispatcher resolves the
//! topic's inbound route, decodes the payload into the bound message type and
//! runs every handler registered for that type, in registration order.
//!
//! The first failing handler aborts the rest: its error is returned as
//! [`DispatchError::HandlerFailed`] and later handlers never see the message.

use crate::routes::{BoxError, RouteError, TopicRouteTable};
use async_trait::async_trait;
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Dispatch errors.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The topic has no inbound route.
    #[error(transparent)]
    RouteNotFound(#[from] RouteError),

    /// The payload could not be decoded into the bound message type.
    #[error("Failed to decode payload for topic {topic:?}: {source}")]
    Decode {
        /// Topic of the command.
        topic: String,
        /// Deserializer error.
        #[source]
        source: BoxError,
    },

    /// No handler is registered for the decoded message type.
    #[error("No handler registered for message type {message_type}")]
    HandlerNotRegistered {
        /// Decoded message type name.
        message_type: &'static str,
    },

    /// A handler returned an error.
    #[error("Handler {handler} failed: {source}")]
    HandlerFailed {
        /// Type name of the failing handler.
        handler: &'static str,
        /// The handler's error.
        #[source]
        source: BoxError,
    },
}

/// The connection a command arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    /// Resolved user identifier.
    pub user_id: String,
    /// Connection the command arrived on.
    pub connection_id: String,
    /// Instance holding the connection.
    pub instance_id: String,
}

impl ConnectionContext {
    /// Create a new connection context.
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        connection_id: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            connection_id: connection_id.into(),
            instance_id: instance_id.into(),
        }
    }
}

/// Handles decoded commands of type `M`.
#[async_trait]
pub trait CommandHandler<M: Send + Sync + 'static>: Send + Sync + 'static {
    /// Handle one command.
    async fn handle(&self, message: &M, ctx: &ConnectionContext) -> Result<(), BoxError>;
}

/// A handler with its message type erased.
#[async_trait]
trait ErasedHandler: Send + Sync {
    fn handler_type(&self) -> &'static str;

    async fn call(
        &self,
        message: &(dyn Any + Send + Sync),
        ctx: &ConnectionContext,
    ) -> Result<(), BoxError>;
}

struct TypedHandler<M, H> {
    handler: H,
    _message: PhantomData<fn() -> M>,
}

#[async_trait]
impl<M, H> ErasedHandler for TypedHandler<M, H>
where
    M: Send + Sync + 'static,
    H: CommandHandler<M>,
{
    fn handler_type(&self) -> &'static str {
        type_name::<H>()
    }

    async fn call(
        &self,
        message: &(dyn Any + Send + Sync),
        ctx: &ConnectionContext,
    ) -> Result<(), BoxError> {
        let message = message
            .downcast_ref::<M>()
            .ok_or_else(|| format!("expected a {}", type_name::<M>()))?;
        self.handler.handle(message, ctx).await
    }
}

/// Builds a [`Dispatcher`] during the configuration phase.
pub struct DispatcherBuilder {
    routes: Arc<TopicRouteTable>,
    handlers: HashMap<TypeId, Vec<Arc<dyn ErasedHandler>>>,
}

impl DispatcherBuilder {
    /// Register a handler for message type `M`.
    ///
    /// Several handlers may be registered for one type; they run in
    /// registration order.
    #[must_use]
    pub fn register<M, H>(mut self, handler: H) -> Self
    where
        M: Send + Sync + 'static,
        H: CommandHandler<M>,
    {
        debug!(
            message_type = type_name::<M>(),
            handler = type_name::<H>(),
            "Registered command handler"
        );
        self.handlers
            .entry(TypeId::of::<M>())
            .or_default()
            .push(Arc::new(TypedHandler {
                handler,
                _message: PhantomData,
            }));
        self
    }

    /// Finish configuration.
    ///
    /// Inbound routes whose declared handler type was never registered are
    /// reported here; commands on them fail with
    /// [`DispatchError::HandlerNotRegistered`].
    #[must_use]
    pub fn build(self) -> Dispatcher {
        for route in self.routes.inbound_routes() {
            let registered = self.handlers.get(&route.message_type_id()).is_some_and(|handlers| {
                handlers
                    .iter()
                    .any(|h| h.handler_type() == route.handler_type())
            });
            if !registered {
                warn!(
                    topic = %route.topic(),
                    handler = route.handler_type(),
                    "Inbound route has no registered handler"
                );
            }
        }

        Dispatcher {
            routes: self.routes,
            handlers: self.handlers,
        }
    }
}

/// Resolves and invokes inbound command handlers.
pub struct Dispatcher {
    routes: Arc<TopicRouteTable>,
    handlers: HashMap<TypeId, Vec<Arc<dyn ErasedHandler>>>,
}

impl Dispatcher {
    /// Start building a dispatcher over a route table.
    #[must_use]
    pub fn builder(routes: Arc<TopicRouteTable>) -> DispatcherBuilder {
        DispatcherBuilder {
            routes,
            handlers: HashMap::new(),
        }
    }

    /// The route table this dispatcher resolves against.
    #[must_use]
    pub fn routes(&self) -> &TopicRouteTable {
        &self.routes
    }

    /// Number of handlers registered for message type `M`.
    #[must_use]
    pub fn handler_count<M: 'static>(&self) -> usize {
        self.handlers.get(&TypeId::of::<M>()).map_or(0, Vec::len)
    }

    /// Decode and handle one command.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic is unknown, the payload does not decode,
    /// no handler is registered, or a handler fails.
    pub async fn handle(
        &self,
        topic: &str,
        raw_payload: &str,
        ctx: &ConnectionContext,
    ) -> Result<(), DispatchError> {
        let route = self.routes.resolve_inbound(topic)?;

        let message = route
            .decode(raw_payload)
            .map_err(|source| DispatchError::Decode {
                topic: topic.to_string(),
                source,
            })?;

        let handlers = self
            .handlers
            .get(&route.message_type_id())
            .filter(|handlers| !handlers.is_empty())
            .ok_or(DispatchError::HandlerNotRegistered {
                message_type: route.message_type(),
            })?;

        for handler in handlers {
            trace!(topic = %topic, handler = handler.handler_type(), "Invoking handler");

            if let Err(source) = handler.call(&*message, ctx).await {
                warn!(
                    topic = %topic,
                    connection = %ctx.connection_id,
                    handler = handler.handler_type(),
                    error = %source,
                    "Handler failed, skipping remaining handlers"
                );
                return Err(DispatchError::HandlerFailed {
                    handler: handler.handler_type(),
                    source,
                });
            }
        }

        Ok(())
    }
}
