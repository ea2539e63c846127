//! Built-in topics.
//!
//! - `echo` (inbound): `{"text": ...}`, answered with a `notice` to every
//!   connection of the sending user, wherever they are connected
//! - `notice` (outbound): `{"text": ..., "from": ...}`

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tenvis_beacon_core::{
    BoxError, CommandHandler, ConfigError, ConnectionContext, DeliveryGateway, TopicRouteTable,
};
use tracing::debug;

/// Inbound `echo` command.
#[derive(Debug, Clone, Deserialize)]
pub struct EchoCommand {
    pub text: String,
}

/// Outbound `notice` message.
#[derive(Debug, Clone, Serialize)]
pub struct Notice {
    pub text: String,
    pub from: String,
}

/// Echoes commands back to all of the sender's connections.
pub struct EchoHandler {
    gateway: Arc<DeliveryGateway>,
}

impl EchoHandler {
    pub fn new(gateway: Arc<DeliveryGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl CommandHandler<EchoCommand> for EchoHandler {
    async fn handle(&self, message: &EchoCommand, ctx: &ConnectionContext) -> Result<(), BoxError> {
        let notice = Notice {
            text: message.text.clone(),
            from: ctx.connection_id.clone(),
        };
        let delivered = self.gateway.send_to_user(&ctx.user_id, &notice).await?;
        debug!(user = %ctx.user_id, delivered, "Echoed command");
        Ok(())
    }
}

/// Bind the built-in topics.
///
/// # Errors
///
/// Returns an error if a binding is rejected.
pub fn route_table() -> Result<TopicRouteTable, ConfigError> {
    let mut table = TopicRouteTable::new();
    table
        .bind_inbound_json::<EchoCommand, EchoHandler>("echo")?
        .bind_outbound_json::<Notice>("notice")?;
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_table() {
        let table = route_table().unwrap();
        assert_eq!(table.resolve_outbound::<Notice>().unwrap().topic(), "notice");
        assert!(table
            .resolve_inbound("echo")
            .unwrap()
            .handler_type()
            .ends_with("EchoHandler"));
    }
}
