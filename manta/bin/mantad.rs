use std::sync::Arc;

use clap::Parser;
use manta::{
    config::Config,
    net,
    server::{self, ServerState},
    MantaError, MantaResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// manta sandbox control plane daemon.
///
/// Configuration comes from MANTA_* environment variables; the flags below
/// override the environment where present.
#[derive(Debug, Parser)]
#[command(name = "mantad", version, about)]
struct MantadArgs {
    /// Address to listen on (overrides MANTA_LISTEN_ADDR).
    #[arg(long)]
    listen_addr: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> MantaResult<()> {
    tracing_subscriber::fmt::init();

    let args = MantadArgs::parse();

    if !nix::unistd::geteuid().is_root() {
        return Err(MantaError::Config(
            "this server must run as root (netns, tap, and NAT setup require it)".to_string(),
        ));
    }

    let mut cfg = Config::from_env()?;
    if let Some(listen_addr) = args.listen_addr {
        cfg.listen_addr = listen_addr;
    }

    if cfg.host_nat_iface.is_empty() {
        cfg.host_nat_iface = net::detect_default_interface().await.map_err(|e| {
            MantaError::Config(format!("detect default host interface: {}", e))
        })?;
    }

    server::ensure_preflight(&cfg).await?;
    server::log_startup_diagnostics(&cfg).await;

    let state = ServerState::new(Arc::new(cfg)).await?;
    server::serve(state).await
}
