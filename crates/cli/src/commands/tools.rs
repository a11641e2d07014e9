//! `kestrel tools`: discover tools and list what the model would see.

use kestrel_core::ToolKind;

pub async fn run(json: bool) -> anyhow::Result<()> {
    let config = super::load_config()?;
    let registry = super::discover(&config, None).await;

    if json {
        let declarations = registry.get_function_declarations();
        println!("{}", serde_json::to_string_pretty(&declarations)?);
        registry.shutdown().await;
        return Ok(());
    }

    let tools = registry.get_all_tools();
    println!("Available tools ({})", tools.len());
    println!("=====================");
    for tool in &tools {
        let kind = match tool.kind() {
            ToolKind::Native => "native",
            ToolKind::Subprocess => "discovered",
            ToolKind::Mcp => "mcp",
        };
        let summary = tool.description().lines().next().unwrap_or_default();
        println!("  {:<32} [{kind}] {summary}", tool.name());
    }

    registry.shutdown().await;
    Ok(())
}
