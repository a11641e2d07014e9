//! `kestrel doctor`: diagnose configuration and environment.

use kestrel_config::AppConfig;
use kestrel_providers::router::build_default;

pub async fn run() -> anyhow::Result<()> {
    println!("Kestrel Doctor: system diagnostics");
    println!("==================================\n");

    let mut issues = 0;

    let config_path = AppConfig::config_dir().join("config.toml");
    if config_path.exists() {
        println!("  ok    Config file found at {}", config_path.display());
    } else {
        println!("  info  No config file at {}, using defaults", config_path.display());
    }

    let config = match AppConfig::load() {
        Ok(config) => {
            println!("  ok    Configuration valid");
            config
        }
        Err(e) => {
            println!("  FAIL  Configuration invalid: {e}");
            println!();
            println!("  1 issue found. Fix the config file and run again.");
            return Ok(());
        }
    };

    match build_default(&config) {
        Ok(generator) => println!("  ok    Model backend: {} ({:?})", generator.name(), config.auth),
        Err(e) if config.providers.is_empty() => {
            println!("  FAIL  No model backend: {e}");
            issues += 1;
        }
        Err(e) => println!("  warn  Default backend unavailable ({e}); named providers may still serve routes"),
    }

    let target = config.target_dir();
    if target.is_dir() {
        println!("  ok    Target directory {}", target.display());
    } else {
        println!("  FAIL  Target directory {} does not exist", target.display());
        issues += 1;
    }

    match (&config.tools.discovery_command, &config.tools.call_command) {
        (Some(_), None) => {
            println!("  FAIL  tools.discovery_command is set but tools.call_command is not");
            issues += 1;
        }
        (Some(discovery), Some(_)) => println!("  ok    Tool discovery: {discovery}"),
        (None, _) => println!("  info  No tool discovery command"),
    }

    for (name, server) in &config.mcp_servers {
        if server.command.is_none() && server.tcp.is_none() {
            println!("  FAIL  MCP server \"{name}\" has neither command nor tcp");
            issues += 1;
        }
    }
    if !config.mcp_servers.is_empty() {
        println!(
            "  info  {} MCP server(s) configured; run `kestrel mcp` to connect",
            config.mcp_servers.len()
        );
    }

    println!();
    if issues == 0 {
        println!("  All checks passed!");
    } else {
        println!("  {issues} issue(s) found. See above for details.");
    }

    Ok(())
}
