use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use super::{
    CertificateInfoPlugin, CommandId, FallbackScsvPlugin, HttpHeadersPlugin, Plugin,
    ProtocolVersionsPlugin,
};

/// Maps each scan command to the plugin that executes it.
///
/// Built once and handed to the scheduler; never mutated while scans run.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: HashMap<CommandId, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_plugins() -> Self {
        Self::new()
            .with_plugin(Arc::new(ProtocolVersionsPlugin))
            .with_plugin(Arc::new(CertificateInfoPlugin))
            .with_plugin(Arc::new(FallbackScsvPlugin))
            .with_plugin(Arc::new(HttpHeadersPlugin))
    }

    /// Registers `plugin` for every command it declares. A later plugin
    /// replaces an earlier one for the same command.
    pub fn with_plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        for id in plugin.commands() {
            if let Some(previous) = self.plugins.insert(*id, plugin.clone()) {
                warn!("{} replaces {} for {}", plugin.name(), previous.name(), id);
            }
        }
        self
    }

    pub fn get(&self, id: CommandId) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(&id).cloned()
    }

    pub fn commands(&self) -> Vec<CommandId> {
        let mut ids: Vec<CommandId> = self.plugins.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
