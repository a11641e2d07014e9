//! `kestrel mcp`: connect to configured MCP servers and report status.

use kestrel_core::ToolKind;

pub async fn run() -> anyhow::Result<()> {
    let config = super::load_config()?;
    if config.mcp_servers.is_empty() {
        println!("No MCP servers configured.");
        println!(
            "Add a [mcp_servers.<name>] table to {}",
            kestrel_config::AppConfig::config_dir().join("config.toml").display()
        );
        return Ok(());
    }

    let registry = super::discover(&config, None).await;

    println!("MCP servers");
    println!("===========");
    for (name, status) in registry.mcp_server_statuses() {
        let Some(server) = config.mcp_servers.get(&name) else {
            continue;
        };
        let endpoint = match (&server.command, &server.tcp) {
            (Some(command), _) => format!("stdio: {command} {}", server.args.join(" ")),
            (None, Some(addr)) => format!("tcp: {addr}"),
            (None, None) => "unconfigured".to_string(),
        };
        let trust = if server.trust { ", trusted" } else { "" };
        println!("  {name:<20} {status:<12} {}{trust}", endpoint.trim_end());
    }

    let tools: Vec<_> = registry
        .get_all_tools()
        .into_iter()
        .filter(|t| t.kind() == ToolKind::Mcp)
        .collect();
    println!();
    println!("MCP tools ({})", tools.len());
    for tool in &tools {
        println!("  {:<32} {}", tool.name(), tool.display_name());
    }

    registry.shutdown().await;
    Ok(())
}
