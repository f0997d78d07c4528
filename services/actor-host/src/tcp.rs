//! Line-delimited JSON transport.
//!
//! Each TCP connection opens with one handshake line, then carries one JSON
//! frame per line in both directions:
//!
//! ```text
//! -> {"type":"connect","query":{"kind":"get_or_create_for_key","name":"counter","key":["a"]}}
//! <- {"tag":"Init","val":{"actorId":"act_...","connectionId":"conn_...","connectionToken":"..."}}
//! -> {"tag":"ActionRequest","val":{"id":1,"name":"increment","args":[]}}
//! <- {"tag":"ActionResponse","val":{"id":1,"output":1}}
//! ```
//!
//! A client that loses its socket can resume with
//! `{"type":"reconnect","actorId":..,"connectionId":..,"connectionToken":..}`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ember_id::{ActorId, ConnId};
use ember_protocol::{Encoding, ToClient, WirePayload};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

use crate::actors::{
    ActorError, ActorManager, ActorQuery, ChannelSink, ConnSink, ConnectRequest, SinkEvent,
};

/// Transport name recorded on connections opened here.
pub const DRIVER_NAME: &str = "tcp";

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Handshake {
    Connect {
        query: ActorQuery,
        #[serde(default)]
        params: Value,
        #[serde(default)]
        auth: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    Reconnect {
        actor_id: ActorId,
        connection_id: ConnId,
        connection_token: String,
    },
}

/// Accepts clients until shutdown is signalled.
pub async fn serve(
    listener: TcpListener,
    manager: ActorManager,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let local_addr = listener.local_addr()?;
    info!(bind_addr = %local_addr, "Listener started");

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Listener shutting down");
                    break;
                }
            }

            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    let manager = manager.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(
                        async move {
                            if let Err(e) = handle_client(stream, peer_addr, manager, shutdown).await {
                                debug!(peer_addr = %peer_addr, error = %e, "Client session error");
                            }
                        }
                        .instrument(tracing::info_span!("client", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    Ok(())
}

async fn handle_client(
    stream: TcpStream,
    peer_addr: SocketAddr,
    manager: ActorManager,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let Some(first) = lines.next_line().await? else {
        return Ok(());
    };

    let (sink, mut events) = ChannelSink::new();
    let sink: Arc<dyn ConnSink> = Arc::new(sink);
    let attached = match serde_json::from_str::<Handshake>(&first) {
        Ok(Handshake::Connect { query, params, auth }) => {
            let request = ConnectRequest {
                params,
                auth,
                encoding: Encoding::Json,
                driver: DRIVER_NAME.to_string(),
                sink: Arc::clone(&sink),
            };
            manager.connect(&query, request).await
        }
        Ok(Handshake::Reconnect {
            actor_id,
            connection_id,
            connection_token,
        }) => {
            manager
                .reconnect(actor_id, connection_id, &connection_token, Arc::clone(&sink))
                .await
        }
        Err(e) => Err(ActorError::MalformedMessage(e.to_string())),
    };

    let conn = match attached {
        Ok(conn) => conn,
        Err(e) => {
            debug!(peer_addr = %peer_addr, error = %e, "Handshake rejected");
            write_line(&mut writer, &serde_json::to_string(&ToClient::Error(e.to_error_frame(None)))?).await?;
            let _ = writer.shutdown().await;
            return Ok(());
        }
    };
    let (actor_id, conn_id) = (conn.actor_id, conn.conn_id);
    info!(actor_id = %actor_id, conn_id = %conn_id, "Client attached");

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }

            event = events.recv() => match event {
                Some(SinkEvent::Frame(WirePayload::Text(text))) => write_line(&mut writer, &text).await?,
                Some(SinkEvent::Frame(WirePayload::Binary(_))) => {
                    warn!(conn_id = %conn_id, "Dropping binary frame on text transport");
                }
                Some(SinkEvent::Close(reason)) => {
                    debug!(conn_id = %conn_id, reason = ?reason, "Actor closed the connection");
                    break;
                }
                None => break,
            },

            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    if let Err(e) = manager.send_frame(actor_id, conn_id, WirePayload::Text(line)).await {
                        debug!(conn_id = %conn_id, error = %e, "Actor is gone, closing client");
                        break;
                    }
                }
                Ok(None) => {
                    debug!(conn_id = %conn_id, "Client hung up");
                    manager.conn_dropped(actor_id, conn_id).await;
                    break;
                }
                Err(e) => {
                    debug!(conn_id = %conn_id, error = %e, "Client read failed");
                    manager.conn_dropped(actor_id, conn_id).await;
                    break;
                }
            },
        }
    }

    let _ = writer.shutdown().await;
    Ok(())
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}
