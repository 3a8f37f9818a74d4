//! Applies pushed configuration changes.

use crate::api::InstanceApi;
use crate::connection::{CommandKind, Message, MessageHandler, MessageKind};
use crate::core::ConfigStore;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Re-fetches the instance configuration when the service announces a change.
///
/// Only `config_update` commands trigger a fetch; other commands are ignored.
pub struct ConfigUpdateHandler {
    store: Arc<ConfigStore>,
    api: Arc<dyn InstanceApi>,
}

impl ConfigUpdateHandler {
    /// Create a handler that updates `store` with values fetched from `api`.
    pub fn new(store: Arc<ConfigStore>, api: Arc<dyn InstanceApi>) -> Self {
        Self { store, api }
    }
}

#[async_trait]
impl MessageHandler for ConfigUpdateHandler {
    fn kind(&self) -> MessageKind {
        MessageKind::CommandExecution
    }

    async fn handle(&self, message: &Message) -> Result<()> {
        let Message::CommandExecution {
            instance_id,
            command,
            ..
        } = message
        else {
            return Ok(());
        };

        if command.kind != CommandKind::ConfigUpdate {
            debug!(instance_id = %instance_id, kind = ?command.kind, "Ignoring command");
            return Ok(());
        }

        let values = self.api.get_instance_configuration(instance_id).await?;
        let changes = self.store.apply_update(values);

        if !changes.is_empty() {
            info!(
                instance_id = %instance_id,
                changed = ?changes.keys().collect::<Vec<_>>(),
                "Received a config update"
            );
        }
        Ok(())
    }
}
