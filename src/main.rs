#![forbid(unsafe_code)]

use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use cifs_ipc::config;
use cifs_ipc::dcerpc::pipe::PipeHandlerRegistry;
use cifs_ipc::server::{self, ServerState};
use cifs_ipc::transport::TcpPacketHandler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .filter(|a| a != "--config")
        .or_else(|| {
            std::env::args()
                .position(|a| a == "--config")
                .and_then(|i| std::env::args().nth(i + 1))
        })
        .unwrap_or_else(|| "config.toml".to_string());

    let config = config::load_config(&config_path)?;

    // Pipe request handlers and logged on circuits come from the embedding
    // server; on its own the binary only frames and rejects requests.
    let handlers = PipeHandlerRegistry::new();

    let server_state = Arc::new(ServerState::new(config.clone(), handlers));
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("{} listening on {}", config.server_name, addr);
    info!("Packet pool: {}", server_state.packet_pool());

    // Handle graceful shutdown
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        info!("Connection from {}", peer);
                        let state = server_state.clone();
                        tokio::spawn(async move {
                            let sess = state.new_session(Some(peer));
                            let handler =
                                TcpPacketHandler::new(stream, Arc::clone(state.packet_pool()));
                            if let Err(e) = server::handle_connection(handler, &sess).await {
                                error!("Connection from {} error: {}", peer, e);
                            }
                            info!("Connection from {} closed", peer);
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {:?}", e);
                    }
                }
            }
            _ = &mut shutdown => {
                info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}
