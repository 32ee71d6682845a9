//! Remote log mirror
//!
//! Plain TCP server streaming every formatted log line to connected clients
//! (telnet or netcat). Anything a client sends is read and discarded.

use std::net::SocketAddr;

use common::logging::LogBroadcast;
use errors::{BridgeError, BridgeResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Bound log mirror server
pub struct LogMirrorServer {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl LogMirrorServer {
    pub async fn bind(
        address: SocketAddr,
        mirror: LogBroadcast,
        shutdown: CancellationToken,
    ) -> BridgeResult<Self> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| BridgeError::Bind {
                address: address.to_string(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr()?;
        info!("Log mirror listening on {}", local_addr);

        let task = tokio::spawn(accept_loop(listener, mirror, shutdown));
        Ok(Self { local_addr, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for LogMirrorServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn accept_loop(listener: TcpListener, mirror: LogBroadcast, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!("Log client connected: {}", peer);
                    tokio::spawn(stream_logs(stream, mirror.clone(), shutdown.child_token()));
                },
                Err(e) => warn!("Log mirror accept failed: {}", e),
            },
        }
    }
}

async fn stream_logs(stream: TcpStream, mirror: LogBroadcast, shutdown: CancellationToken) {
    let mut lines = mirror.subscribe();
    let (mut reader, mut writer) = stream.into_split();
    let mut discard = [0u8; 64];

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.recv() => {
                let written = match line {
                    Ok(line) => writer.write_all(&line).await,
                    Err(RecvError::Lagged(skipped)) => {
                        let notice = format!("... {skipped} log lines dropped\r\n");
                        writer.write_all(notice.as_bytes()).await
                    },
                    Err(RecvError::Closed) => break,
                };
                if written.is_err() {
                    break;
                }
            }
            read = reader.read(&mut discard) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {},
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lines_reach_client_and_input_is_ignored() {
        let mirror = LogBroadcast::new(16);
        let server = LogMirrorServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            mirror.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
        client.write_all(b"help\r\n").await.unwrap();

        for _ in 0..100 {
            if mirror.receiver_count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(mirror.receiver_count(), 1);

        mirror.publish(Bytes::from_static(b"[INFO] Request queued\n"));

        let mut buf = vec![0u8; 64];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"[INFO] Request queued\n");
    }
}
