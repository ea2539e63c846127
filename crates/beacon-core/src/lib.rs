//! # beacon-core
//!
//! Connection presence, topic routing and cross-instance delivery for Beacon.
//!
//! A fleet of Beacon instances each hold some of a user's live connections.
//! This crate answers "where is this user connected?" and "get this message
//! to them", whichever instance holds the socket:
//!
//! - **Registry** - authoritative `user -> {connection, instance}` mapping
//!   over a shared, TTL-based cache
//! - **Presence** - connections held by this process
//! - **Lock** - token-based mutual exclusion over the same cache
//! - **Reconcile** - periodic re-assertion of local sessions
//! - **Routes / Dispatch** - typed topic bindings and inbound command handlers
//! - **Gateway** - typed fan-out, direct or relayed per connection
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────┐
//! │  Transport  │────▶│  Registry   │────▶│ CacheProvider│
//! └─────────────┘     └─────────────┘     └──────────────┘
//!        ▲                   │
//!        │                   ▼
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │DirectSender │◀────│   Gateway   │────▶│    Relay    │
//! └─────────────┘     └─────────────┘     └─────────────┘
//! ```

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod gateway;
pub mod lock;
pub mod presence;
pub mod reconcile;
pub mod registry;
pub mod relay;
pub mod routes;
pub mod session;
pub mod transport;

pub use cache::{CacheError, CacheProvider, MemoryCache};
#[cfg(feature = "redis")]
pub use cache::RedisCache;
pub use config::{ConfigError, RegistryConfig};
pub use dispatch::{
    CommandHandler, ConnectionContext, DispatchError, Dispatcher, DispatcherBuilder,
};
pub use gateway::{DeliveryGateway, DeliveryStats, GatewayError};
pub use lock::{DistributedLock, LockToken};
pub use presence::LocalPresenceCache;
pub use reconcile::{ReconcileReport, ReconciliationLoop};
pub use registry::{ConnectionRegistry, RegistryError};
#[cfg(feature = "redis")]
pub use relay::RedisRelay;
pub use relay::{LocalRelay, RelayError, RelayInbox, RelayPublisher};
pub use routes::{BoxError, InboundRoute, OutboundRoute, RouteError, TopicRouteTable};
pub use session::{generate_connection_id, generate_instance_id, ConnectionSession, InstanceId};
pub use transport::{ConnectionHub, DirectSender, OutboundMessage, SendError};
