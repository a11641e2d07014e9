pub mod chat;
pub mod doctor;
pub mod mcp;
pub mod tools;

use std::sync::Arc;

use kestrel_config::AppConfig;
use kestrel_core::EventBus;
use kestrel_tools::ToolRegistry;

/// Load the configuration with a readable error.
pub fn load_config() -> anyhow::Result<AppConfig> {
    AppConfig::load().map_err(|e| anyhow::anyhow!("Failed to load config: {e}"))
}

/// Build the registry and run one discovery pass.
pub async fn discover(config: &AppConfig, events: Option<Arc<EventBus>>) -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::from_config(config);
    if let Some(events) = events {
        registry = registry.with_event_bus(events);
    }
    let registry = Arc::new(registry);
    let discovered = registry.discover_tools().await;
    tracing::debug!(discovered, "Tool discovery finished");
    registry
}
