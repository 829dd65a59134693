use clap::Parser;
use manta_agent::AGENT_VERSION;
use tokio_vsock::{VsockAddr, VsockListener};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// In-guest agent serving the manta control plane's RPC over vsock.
#[derive(Debug, Parser)]
#[command(name = "manta-agent", version, about)]
struct AgentArgs {
    /// vsock port to listen on.
    #[arg(long, default_value_t = manta_rpc::DEFAULT_AGENT_PORT)]
    port: u32,
}

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt::init();

    let args = AgentArgs::parse();

    let addr = VsockAddr::new(libc::VMADDR_CID_ANY, args.port);
    let listener = VsockListener::bind(addr)?;
    tracing::info!(port = args.port, version = AGENT_VERSION, "manta-agent listening");

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!(?peer, "connection accepted");
                tokio::spawn(manta_agent::serve_conn(stream));
            }
            Err(err) => {
                tracing::warn!(%err, "accept failed");
            }
        }
    }
}
