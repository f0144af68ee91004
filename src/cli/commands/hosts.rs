use console::style;

use crate::config::AgentConfig;
use crate::error::Result;
use crate::registry::{ConnectionMode, Host, HostRegistry};
use crate::supervisor::ServiceManager;

pub fn execute(config: &AgentConfig) -> Result<()> {
    let registry = HostRegistry::from_config(config);

    println!();
    for host in registry.hosts() {
        print_host(&registry, host);
        println!();
    }

    Ok(())
}

fn print_host(registry: &HostRegistry, host: &Host) {
    let location = match host.mode {
        ConnectionMode::Local => "local".to_string(),
        ConnectionMode::Remote => format!("{}@{}:{}", host.user, host.address, host.port),
    };
    let role = if host.is_hub() { " hub" } else { "" };

    println!(
        "  {} {} {}{}",
        style("●").green().bold(),
        style(&host.key).white().bold(),
        style(format!("({})", host.name)).dim(),
        style(role).cyan()
    );
    println!("  {}  {}", style("Location").dim(), location);

    if host.services.is_empty() {
        println!("  {}  {}", style("Services").dim(), style("none").dim());
        return;
    }
    println!("  {}", style("Services").dim());
    for service in &host.services {
        let manager = match ServiceManager::for_service(registry, host, service) {
            ServiceManager::Supervisor => "pm2",
            ServiceManager::OsService => "systemd",
        };
        println!("    {} {}", service, style(format!("[{}]", manager)).dim());
    }
}
