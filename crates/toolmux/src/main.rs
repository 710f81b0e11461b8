//! toolmux - one command line for many MCP servers.
//!
//! Reads server definitions from a config directory, connects to all of
//! them at once and lets you list, search and call their tools.

mod commands;

use clap::{Parser, Subcommand};
use commands::*;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "toolmux")]
#[command(author, version, about = "Multiplex tools from many MCP servers", long_about = None)]
struct Cli {
    /// Directory holding server config files
    #[arg(long, global = true)]
    servers: Option<PathBuf>,

    /// Token cache file
    #[arg(long, global = true)]
    tokens: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List tools grouped by server
    List,
    /// Search tools by name or description
    Search {
        /// Text to look for
        query: String,
    },
    /// Show connection state of every server
    Status,
    /// Call a tool
    Call {
        /// Server name
        server: String,
        /// Tool name
        tool: String,
        /// Arguments as a JSON object
        #[arg(long)]
        args: Option<String>,
    },
    /// Authorize with an OAuth-protected server
    Auth {
        /// Server name
        server: String,
        /// Seconds to wait for the browser callback
        #[arg(long, default_value_t = 300)]
        timeout: u64,
        /// Print the authorization URL instead of opening a browser
        #[arg(long)]
        no_browser: bool,
        /// Paste the redirect URL instead of running the local callback listener
        #[arg(long, conflicts_with = "no_browser")]
        manual: bool,
    },
    /// Remove cached OAuth credentials for a server
    Logout {
        /// Server name
        server: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let paths = Paths::resolve(cli.servers, cli.tokens)?;

    match cli.command {
        Commands::List => list_tools(&paths).await,
        Commands::Search { query } => search_tools(&paths, &query).await,
        Commands::Status => show_status(&paths).await,
        Commands::Call { server, tool, args } => {
            call_tool(&paths, &server, &tool, args.as_deref()).await
        }
        Commands::Auth {
            server,
            timeout,
            no_browser,
            manual,
        } => auth_server(&paths, &server, timeout, no_browser, manual).await,
        Commands::Logout { server } => logout_server(&paths, &server).await,
    }
}
