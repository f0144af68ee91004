use std::sync::Arc;

use crate::config::AgentConfig;
use crate::error::Result;
use crate::executor::HostExecutor;
use crate::registry::HostRegistry;
use crate::resources::check_resources;

pub async fn execute(config: &AgentConfig, host_key: &str) -> Result<()> {
    let registry = Arc::new(HostRegistry::from_config(config));
    let host = registry.lookup(host_key)?.key.clone();
    let executor = HostExecutor::new(Arc::clone(&registry), config.command_timeout());

    let snapshot = check_resources(&executor, &host).await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    Ok(())
}
