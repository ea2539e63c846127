//! Connection handlers for Beacon server.
//!
//! This module wires the core engine together and runs the connection
//! lifecycle: register on connect, dispatch commands, drain pushes, and
//! unregister on close.

use crate::config::{CacheBackend, Config};
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::topics::{self, EchoHandler};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use beacon_protocol::{codec, Frame, PROTOCOL_VERSION};
use bytes::BytesMut;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tenvis_beacon_core::session::validate_id;
use tenvis_beacon_core::{
    generate_connection_id, generate_instance_id, CacheProvider, ConnectionContext, ConnectionHub,
    ConnectionRegistry, DeliveryGateway, DispatchError, Dispatcher, LocalRelay, MemoryCache,
    ReconciliationLoop, RelayInbox, RelayPublisher,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Error codes carried in `error` frames.
mod codes {
    pub const REGISTRATION_FAILED: u16 = 1001;
    pub const DECODE_FAILED: u16 = 1002;
    pub const PROTOCOL_ERROR: u16 = 1003;
    pub const ROUTE_NOT_FOUND: u16 = 1004;
    pub const HANDLER_NOT_REGISTERED: u16 = 1005;
    pub const HANDLER_FAILED: u16 = 1006;
    pub const MESSAGE_TOO_LARGE: u16 = 1009;
}

type WsSender = SplitSink<WebSocket, Message>;

/// Shared server state.
pub struct AppState {
    /// The connection registry.
    pub registry: Arc<ConnectionRegistry>,
    /// Typed delivery to users and connections.
    pub gateway: Arc<DeliveryGateway>,
    /// Inbound command dispatcher.
    pub dispatcher: Dispatcher,
    /// Outbound queues of local connections.
    pub hub: Arc<ConnectionHub>,
    /// Server configuration.
    pub config: Config,
    /// Cancelled on shutdown.
    pub shutdown: CancellationToken,
}

/// The shared store and relay chosen by configuration.
struct Backend {
    cache: Arc<dyn CacheProvider>,
    relay: Arc<dyn RelayPublisher>,
    inbox: RelayInbox,
}

#[cfg_attr(not(feature = "redis"), allow(unused_variables))]
async fn connect_backend(
    config: &Config,
    instance_id: &str,
    shutdown: &CancellationToken,
) -> Result<Backend> {
    match config.cache.backend {
        CacheBackend::Memory => {
            let relay = Arc::new(LocalRelay::new());
            let inbox = relay.subscribe(instance_id, config.cache.relay_capacity);
            Ok(Backend {
                cache: Arc::new(MemoryCache::new()),
                relay,
                inbox,
            })
        }
        #[cfg(feature = "redis")]
        CacheBackend::Redis => {
            use tenvis_beacon_core::{RedisCache, RedisRelay};

            let cache = RedisCache::connect(&config.cache.url).await?;
            let relay = RedisRelay::connect(&config.cache.url, config.cache.relay_prefix.clone())
                .await?;
            let inbox = relay
                .subscribe(instance_id, config.cache.relay_capacity, shutdown.clone())
                .await?;
            Ok(Backend {
                cache: Arc::new(cache),
                relay: Arc::new(relay),
                inbox,
            })
        }
        #[cfg(not(feature = "redis"))]
        CacheBackend::Redis => {
            anyhow::bail!("cache backend \"redis\" requires building with the `redis` feature")
        }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let shutdown = CancellationToken::new();
    let instance_id = config
        .instance_id
        .clone()
        .unwrap_or_else(generate_instance_id);

    let backend = connect_backend(&config, &instance_id, &shutdown).await?;
    let registry = Arc::new(ConnectionRegistry::new(
        instance_id.clone(),
        backend.cache,
        config.registry.to_registry_config(),
    )?);

    let routes = Arc::new(topics::route_table()?);
    let hub = Arc::new(ConnectionHub::new());
    let gateway = Arc::new(DeliveryGateway::new(
        registry.clone(),
        routes.clone(),
        hub.clone(),
        backend.relay,
    ));
    let dispatcher = Dispatcher::builder(routes)
        .register(EchoHandler::new(gateway.clone()))
        .build();

    let state = Arc::new(AppState {
        registry: registry.clone(),
        gateway: gateway.clone(),
        dispatcher,
        hub,
        config: config.clone(),
        shutdown: shutdown.clone(),
    });

    // Start metrics server if enabled
    let mut tasks = Vec::new();
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
        tasks.push(spawn_metrics_sync(state.clone(), shutdown.clone()));
    }

    tasks.push(ReconciliationLoop::new(registry).spawn(shutdown.clone()));
    tasks.push(gateway.spawn_relay_consumer(backend.inbox, shutdown.clone()));

    // Build router
    let app = Router::new()
        .route(&config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!(instance = %instance_id, "Beacon server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}?user=<id>",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    info!("Beacon server stopped");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
        }
        () = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}

/// Periodically export gateway and presence figures.
fn spawn_metrics_sync(state: Arc<AppState>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    metrics::record_delivery_stats(state.gateway.stats());
                    let presence = state.registry.presence();
                    metrics::set_presence(presence.user_count(), presence.connection_count());
                }
            }
        }
    })
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let presence = state.registry.presence();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "instance": state.registry.instance_id(),
        "users": presence.user_count(),
        "connections": presence.connection_count(),
    }))
}

/// Query parameters of the WebSocket endpoint.
#[derive(Debug, Deserialize)]
struct ConnectParams {
    user: String,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    if let Err(reason) = validate_id(&params.user) {
        return (StatusCode::BAD_REQUEST, reason).into_response();
    }
    if state.hub.len() >= state.config.limits.max_connections {
        metrics::record_error("connection_limit");
        return (StatusCode::SERVICE_UNAVAILABLE, "Connection limit reached").into_response();
    }

    ws.on_upgrade(move |socket| handle_websocket(socket, state, params.user))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, user_id: String) {
    // Record connection metrics
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = generate_connection_id();
    let ctx = ConnectionContext::new(
        user_id.as_str(),
        connection_id.as_str(),
        state.registry.instance_id(),
    );

    let (mut sender, mut receiver) = socket.split();

    // Register the queue first so pushes racing the registration are kept
    let mut outbound = state
        .hub
        .register(connection_id.as_str(), state.config.transport.outbound_queue);

    if let Err(e) = state
        .registry
        .on_connect(&user_id, &connection_id, &ctx.instance_id)
        .await
    {
        metrics::record_registry_rejection();
        state.hub.unregister(&connection_id);
        let frame = Frame::error(0, codes::REGISTRATION_FAILED, e.to_string());
        if send_frame(&mut sender, &frame).await.is_ok() {
            // Best effort; the client may already be gone
            if let Err(e) = sender.send(Message::Close(None)).await {
                debug!(connection = %connection_id, error = %e, "Close after rejection failed");
            }
        }
        return;
    }

    debug!(user = %user_id, connection = %connection_id, "WebSocket connected");

    let heartbeat = u32::try_from(state.config.heartbeat.interval_ms).unwrap_or(u32::MAX);
    let connected = Frame::connected(
        connection_id.as_str(),
        ctx.instance_id.as_str(),
        PROTOCOL_VERSION.major,
        heartbeat,
    );
    if send_frame(&mut sender, &connected).await.is_err() {
        error!(connection = %connection_id, "Failed to send Connected frame");
        close_connection(&state, &ctx).await;
        return;
    }

    // Read buffer for partial frames
    let mut read_buffer = BytesMut::with_capacity(4096);
    let max_message_size = state.config.limits.max_message_size;

    let idle_timeout = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    // Message processing loop
    loop {
        tokio::select! {
            biased;

            () = state.shutdown.cancelled() => {
                debug!(connection = %connection_id, "Closing for shutdown");
                break;
            }

            // Pushes for this connection, local or relayed
            message = outbound.recv() => {
                let Some(message) = message else { break };
                let frame = Frame::push(message.topic, message.payload);
                if send_frame(&mut sender, &frame).await.is_err() {
                    break;
                }
            }

            () = &mut idle => {
                debug!(connection = %connection_id, "Heartbeat timeout");
                break;
            }

            // Receive from WebSocket
            msg = receiver.next() => {
                idle.as_mut().reset(tokio::time::Instant::now() + idle_timeout);

                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let start = Instant::now();
                        metrics::record_message(data.len(), "inbound");
                        read_buffer.extend_from_slice(&data);

                        if read_buffer.len() > max_message_size {
                            warn!(connection = %connection_id, size = read_buffer.len(), "Message too large");
                            metrics::record_error("message_too_large");
                            let frame = Frame::error(0, codes::MESSAGE_TOO_LARGE, "Message too large");
                            if let Err(e) = send_frame(&mut sender, &frame).await {
                                debug!(connection = %connection_id, error = %e, "Failed to report oversize message");
                            }
                            break;
                        }

                        if let Err(e) = drain_frames(&mut read_buffer, &ctx, &state, &mut sender).await {
                            error!(connection = %connection_id, error = %e, "Frame handling error");
                            break;
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Text(text))) => {
                        // Treat text as binary
                        read_buffer.extend_from_slice(text.as_bytes());
                        if let Err(e) = drain_frames(&mut read_buffer, &ctx, &state, &mut sender).await {
                            error!(connection = %connection_id, error = %e, "Frame handling error");
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    close_connection(&state, &ctx).await;
    debug!(user = %user_id, connection = %connection_id, "WebSocket disconnected");
}

async fn close_connection(state: &AppState, ctx: &ConnectionContext) {
    state.hub.unregister(&ctx.connection_id);
    state
        .registry
        .on_disconnect(&ctx.user_id, &ctx.connection_id)
        .await;
}

/// Decode and handle every complete frame in the buffer.
async fn drain_frames(
    buffer: &mut BytesMut,
    ctx: &ConnectionContext,
    state: &AppState,
    sender: &mut WsSender,
) -> Result<()> {
    loop {
        match codec::decode_from(buffer) {
            Ok(Some(frame)) => handle_frame(frame, ctx, state, sender).await?,
            Ok(None) => return Ok(()),
            Err(e) => {
                metrics::record_error("protocol");
                send_frame(sender, &Frame::error(0, codes::PROTOCOL_ERROR, e.to_string())).await?;
                return Err(e.into());
            }
        }
    }
}

/// Handle a decoded frame.
async fn handle_frame(
    frame: Frame,
    ctx: &ConnectionContext,
    state: &AppState,
    sender: &mut WsSender,
) -> Result<()> {
    match frame {
        Frame::Command { id, topic, payload } => {
            trace!(connection = %ctx.connection_id, topic = %topic, "Command");

            match state.dispatcher.handle(&topic, &payload, ctx).await {
                Ok(()) => {
                    if let Some(id) = id {
                        send_frame(sender, &Frame::ack(id)).await?;
                    }
                }
                Err(e) => {
                    metrics::record_dispatch_error(&e);
                    debug!(
                        connection = %ctx.connection_id,
                        topic = %topic,
                        error = %e,
                        "Command rejected"
                    );
                    let frame = Frame::error(id.unwrap_or(0), error_code(&e), e.to_string());
                    send_frame(sender, &frame).await?;
                }
            }
        }

        Frame::Ping { timestamp } => {
            send_frame(sender, &Frame::pong(timestamp)).await?;
        }

        Frame::Pong { .. } => {}

        other => {
            warn!(connection = %ctx.connection_id, frame_type = ?other.frame_type(), "Unexpected frame type");
        }
    }

    Ok(())
}

fn error_code(error: &DispatchError) -> u16 {
    match error {
        DispatchError::RouteNotFound(_) => codes::ROUTE_NOT_FOUND,
        DispatchError::Decode { .. } => codes::DECODE_FAILED,
        DispatchError::HandlerNotRegistered { .. } => codes::HANDLER_NOT_REGISTERED,
        DispatchError::HandlerFailed { .. } => codes::HANDLER_FAILED,
    }
}

/// Send a frame to the WebSocket.
async fn send_frame(sender: &mut WsSender, frame: &Frame) -> Result<()> {
    let data = codec::encode(frame)?;
    metrics::record_message(data.len(), "outbound");
    sender.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}
