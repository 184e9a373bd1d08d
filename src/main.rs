//! Claude QQ Bridge - Entry Point

use std::sync::Arc;

use claude_qq_bridge::{Config, Supervisor};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("Claude QQ Bridge v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: claude-qq-bridge");
        println!();
        println!("Relays OneBot v11 chat events to the Claude Code CLI.");
        println!("All configuration comes from BRIDGE_* environment");
        println!("variables (a local .env file is honored):");
        println!();
        println!("  BRIDGE_GATEWAY_URL        OneBot WebSocket address (ws://127.0.0.1:8081)");
        println!("  BRIDGE_SELF_ID            Bot's own QQ number (required)");
        println!("  BRIDGE_COMMAND_PREFIXES   Command prefixes (/c,/claude,/ask)");
        println!("  BRIDGE_CLI_PATH           Claude CLI command (claude)");
        println!("  BRIDGE_WORK_DIR           Root for per-session working dirs (.)");
        println!("  BRIDGE_INVOKE_TIMEOUT_SECS  Hard invocation timeout (300)");
        println!("  RUST_LOG                  Log filter (info)");
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Config errors are the only fatal ones
    let config = Config::from_env()?;
    info!(
        gateway = %config.gateway_url,
        self_id = config.self_id,
        "Claude QQ Bridge v{}",
        env!("CARGO_PKG_VERSION")
    );

    let supervisor = Arc::new(Supervisor::new(config));

    // ctrl-c triggers a cooperative drain: in-flight invocations are
    // cancelled and the gateway is closed before exit
    let handle = Arc::clone(&supervisor);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, shutting down");
            handle.shutdown();
        }
    });

    supervisor.run().await
}
