//! Tool discovery and invocation command handlers.

use super::Paths;
use anyhow::Context;
use serde_json::Value;
use toolmux_mcp::{BringUpReport, IndexedTool};

fn print_failures(report: &BringUpReport) {
    for server in &report.auth_required {
        eprintln!("! {server}: authorization required (run `toolmux auth {server}`)");
    }
    for (server, error) in &report.failed {
        eprintln!("✗ {server}: {error}");
    }
}

fn print_grouped(tools: &[IndexedTool]) {
    let mut current: Option<&str> = None;
    for entry in tools {
        if current != Some(entry.key.server.as_str()) {
            if current.is_some() {
                println!();
            }
            println!("{}:", entry.key.server);
            current = Some(entry.key.server.as_str());
        }
        match entry.tool.description.as_deref() {
            Some(description) => {
                let first_line = description.lines().next().unwrap_or_default();
                println!("  {:<30} {}", entry.tool.name, first_line);
            }
            None => println!("  {}", entry.tool.name),
        }
    }
}

/// List tools of every connected server.
pub async fn list_tools(paths: &Paths) -> anyhow::Result<()> {
    let (manager, report) = paths.connect(None).await?;
    print_failures(&report);

    let tools = manager.all_tools().await;
    if tools.is_empty() {
        println!("No tools available.");
    } else {
        print_grouped(&tools);
    }

    manager.disconnect_all().await;
    Ok(())
}

/// Search tools by name or description.
pub async fn search_tools(paths: &Paths, query: &str) -> anyhow::Result<()> {
    let (manager, report) = paths.connect(None).await?;
    print_failures(&report);

    let matches = manager.search_tools(query).await;
    if matches.is_empty() {
        println!("No tools matching '{query}'.");
    } else {
        println!("{} tool(s) matching '{query}':", matches.len());
        println!();
        print_grouped(&matches);
    }

    manager.disconnect_all().await;
    Ok(())
}

/// Show connection state of every configured server.
pub async fn show_status(paths: &Paths) -> anyhow::Result<()> {
    let (manager, _) = paths.connect(None).await?;
    let statuses = manager.statuses().await;
    let tokens = paths
        .token_store()
        .all()
        .await
        .context("Failed to read token cache")?;

    println!("{:<20} {:<15} {:>6} {}", "NAME", "STATE", "TOOLS", "TOKEN");
    println!("{}", "-".repeat(60));

    for (name, status) in &statuses {
        let token = match tokens.get(name) {
            None => "-".to_string(),
            Some(set) => match set.expires_at {
                None => "cached".to_string(),
                Some(_) if set.is_expired() => "expired".to_string(),
                Some(at) => format!("expires {}", at.format("%Y-%m-%d %H:%M UTC")),
            },
        };
        println!(
            "{:<20} {:<15} {:>6} {}",
            name, status.state, status.tools, token
        );
    }

    let errors: Vec<_> = statuses
        .iter()
        .filter_map(|(name, status)| status.error.as_ref().map(|e| (name, e)))
        .collect();
    if !errors.is_empty() {
        println!();
        for (name, error) in errors {
            println!("{name}: {error}");
        }
    }

    manager.disconnect_all().await;
    Ok(())
}

fn parse_arguments(args: Option<&str>) -> anyhow::Result<Option<Value>> {
    let Some(raw) = args else {
        return Ok(None);
    };
    let value: Value = serde_json::from_str(raw).context("--args is not valid JSON")?;
    if !value.is_object() {
        anyhow::bail!("--args must be a JSON object");
    }
    Ok(Some(value))
}

/// Call one tool and print its text output.
pub async fn call_tool(
    paths: &Paths,
    server: &str,
    tool: &str,
    args: Option<&str>,
) -> anyhow::Result<()> {
    let arguments = parse_arguments(args)?;
    let (manager, report) = paths.connect(Some(server)).await?;
    print_failures(&report);

    let result = manager.call_tool(server, tool, arguments).await;
    manager.disconnect_all().await;
    let result = result.with_context(|| format!("Calling {server}:{tool} failed"))?;

    let text = result.text();
    if !text.is_empty() {
        println!("{text}");
    }
    if let Some(structured) = &result.structured_content {
        println!("{}", serde_json::to_string_pretty(structured)?);
    }
    if result.is_error {
        anyhow::bail!("{server}:{tool} reported an error");
    }
    Ok(())
}
