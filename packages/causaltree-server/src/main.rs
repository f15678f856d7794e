//! Line-delimited JSON listener: one `ClientMessage` per input line, one
//! `ServerMessage` per output line.

use std::sync::Arc;

use causaltree_server::{
    telemetry, CausalRepoServer, ClientMessage, Result, ServerConfig, ServerMessage,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::load_from(&path)?,
        None => ServerConfig::load()?,
    };
    telemetry::init_logging(&config.logging)?;

    let bind_addr = config.listen.bind_addr.clone();
    let server = Arc::new(CausalRepoServer::from_config(config)?);
    let maintenance = server.spawn_maintenance();

    let listener = TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let server = Arc::clone(&server);
                tokio::spawn(async move {
                    if let Err(e) = serve(server, stream, peer.to_string()).await {
                        warn!(peer = %peer, error = %e, "connection ended with error");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    maintenance.abort();
    server.shutdown().await;
    Ok(())
}

async fn serve(server: Arc<CausalRepoServer>, stream: TcpStream, device: String) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let (session, mut outbound) = server.connect(device.clone());
    let errors = session.outbound();
    let (inbound_tx, inbound_rx) = mpsc::channel::<ClientMessage>(64);
    let session_task = tokio::spawn(session.run(inbound_rx));

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let mut line = match serde_json::to_vec(&message) {
                Ok(line) => line,
                Err(e) => {
                    error!(error = %e, "could not encode server message");
                    continue;
                }
            };
            line.push(b'\n');
            if write.write_all(&line).await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(read).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ClientMessage>(&line) {
            Ok(message) => {
                if inbound_tx.send(message).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(device = %device, error = %e, "malformed client message");
                let reply = ServerMessage::error(None, format!("malformed message: {e}"));
                if errors.send(reply).await.is_err() {
                    break;
                }
            }
        }
    }

    drop(inbound_tx);
    drop(errors);
    let _ = session_task.await;
    let _ = writer.await;
    Ok(())
}
