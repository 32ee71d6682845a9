//! Modbus TCP server adapter

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use errors::{BridgeError, BridgeResult};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::frame::{exception_pdu, MbapCodec, MbapFrame, MAX_PDU_SIZE};
use crate::transport::{ExceptionCode, NetworkEvent, NetworkFrameMeta, NetworkTransport};

/// Events buffered between the socket tasks and the engine
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Replies buffered per connection
const REPLY_CHANNEL_CAPACITY: usize = 16;

type PeerTable = Arc<DashMap<SocketAddr, mpsc::Sender<MbapFrame>>>;

/// Modbus TCP server feeding the bridge engine
pub struct TcpServerAdapter {
    local_addr: SocketAddr,
    events: mpsc::Receiver<NetworkEvent>,
    peers: PeerTable,
    pending_transaction_id: u16,
    accept_task: JoinHandle<()>,
}

impl TcpServerAdapter {
    /// Bind the listener and start accepting clients
    pub async fn bind(config: &NetworkConfig, shutdown: CancellationToken) -> BridgeResult<Self> {
        let address = config.bind_address.clone();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|e| BridgeError::Bind {
                address: address.clone(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr()?;
        info!("Modbus TCP server listening on {}", local_addr);

        let (events_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let peers: PeerTable = Arc::new(DashMap::new());
        let accept_task = tokio::spawn(accept_loop(
            listener,
            events_tx,
            Arc::clone(&peers),
            config.max_connections,
            shutdown,
        ));

        Ok(Self {
            local_addr,
            events,
            peers,
            pending_transaction_id: 0,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn queue_reply(&self, peer: SocketAddr, unit_id: u8, pdu: Bytes) -> bool {
        let Some(writer) = self.peers.get(&peer) else {
            debug!("Reply dropped: {} is no longer connected", peer);
            return false;
        };
        let frame = MbapFrame {
            transaction_id: self.pending_transaction_id,
            unit_id,
            pdu,
        };
        writer.try_send(frame).is_ok()
    }
}

impl Drop for TcpServerAdapter {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

impl NetworkTransport for TcpServerAdapter {
    fn poll_events(&mut self, events: &mut Vec<NetworkEvent>) {
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
    }

    fn set_pending_transaction_id(&mut self, transaction_id: u16) {
        self.pending_transaction_id = transaction_id;
    }

    fn send_error_reply(
        &mut self,
        peer: SocketAddr,
        function_code: u8,
        exception: ExceptionCode,
        unit_id: u8,
    ) -> bool {
        let pdu = exception_pdu(function_code, exception.code());
        self.queue_reply(peer, unit_id, Bytes::copy_from_slice(&pdu))
    }

    fn send_raw_reply(&mut self, peer: SocketAddr, pdu: &[u8], unit_id: u8) -> bool {
        if pdu.is_empty() || pdu.len() > MAX_PDU_SIZE {
            return false;
        }
        self.queue_reply(peer, unit_id, Bytes::copy_from_slice(pdu))
    }
}

async fn accept_loop(
    listener: TcpListener,
    events: mpsc::Sender<NetworkEvent>,
    peers: PeerTable,
    max_connections: usize,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    },
                };
                if peers.len() >= max_connections {
                    warn!("Connection from {} refused: {} clients connected", peer, max_connections);
                    continue;
                }

                let (reply_tx, reply_rx) = mpsc::channel(REPLY_CHANNEL_CAPACITY);
                peers.insert(peer, reply_tx);
                if events.send(NetworkEvent::PeerConnected(peer)).await.is_err() {
                    break;
                }
                tokio::spawn(serve_client(
                    stream,
                    peer,
                    reply_rx,
                    events.clone(),
                    Arc::clone(&peers),
                    shutdown.child_token(),
                ));
            }
        }
    }
    debug!("TCP accept loop stopped");
}

async fn serve_client(
    stream: TcpStream,
    peer: SocketAddr,
    mut replies: mpsc::Receiver<MbapFrame>,
    events: mpsc::Sender<NetworkEvent>,
    peers: PeerTable,
    shutdown: CancellationToken,
) {
    let (mut sink, mut requests) = Framed::new(stream, MbapCodec).split();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            reply = replies.recv() => {
                let Some(reply) = reply else { break };
                if let Err(e) = sink.send(reply).await {
                    warn!("Write to {} failed: {}", peer, e);
                    break;
                }
            }
            request = requests.next() => match request {
                Some(Ok(frame)) => {
                    let event = NetworkEvent::Request {
                        pdu: frame.pdu,
                        meta: NetworkFrameMeta {
                            unit_id: frame.unit_id,
                            transaction_id: frame.transaction_id,
                            peer,
                        },
                    };
                    if events.send(event).await.is_err() {
                        break;
                    }
                },
                Some(Err(e)) => {
                    warn!("Closing {}: {}", peer, e);
                    break;
                },
                None => break,
            },
        }
    }

    peers.remove(&peer);
    let _ = events.send(NetworkEvent::PeerDisconnected(Some(peer))).await;
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn adapter(max_connections: usize) -> TcpServerAdapter {
        let config = NetworkConfig {
            bind_address: "127.0.0.1:0".to_string(),
            max_connections,
        };
        TcpServerAdapter::bind(&config, CancellationToken::new())
            .await
            .unwrap()
    }

    async fn next_events(adapter: &mut TcpServerAdapter, count: usize) -> Vec<NetworkEvent> {
        let mut events = Vec::new();
        for _ in 0..200 {
            adapter.poll_events(&mut events);
            if events.len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        events
    }

    #[tokio::test]
    async fn test_request_and_reply_over_socket() {
        let mut adapter = adapter(4).await;
        let mut client = TcpStream::connect(adapter.local_addr()).await.unwrap();
        client
            .write_all(&[0x00, 0x07, 0x00, 0x00, 0x00, 0x06, 0x03, 0x03, 0x00, 0x00, 0x00, 0x01])
            .await
            .unwrap();

        let events = next_events(&mut adapter, 2).await;
        assert!(matches!(events[0], NetworkEvent::PeerConnected(_)));
        let NetworkEvent::Request { pdu, meta } = &events[1] else {
            panic!("expected a request, got {:?}", events[1]);
        };
        assert_eq!(&pdu[..], &[0x03, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(meta.transaction_id, 7);
        assert_eq!(meta.unit_id, 3);

        adapter.set_pending_transaction_id(7);
        assert!(adapter.send_raw_reply(meta.peer, &[0x03, 0x02, 0x00, 0x2A], 3));

        let mut reply = [0u8; 11];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(
            reply,
            [0x00, 0x07, 0x00, 0x00, 0x00, 0x05, 0x03, 0x03, 0x02, 0x00, 0x2A]
        );
    }

    #[tokio::test]
    async fn test_error_reply_encoding() {
        let mut adapter = adapter(4).await;
        let mut client = TcpStream::connect(adapter.local_addr()).await.unwrap();
        let local = client.local_addr().unwrap();
        next_events(&mut adapter, 1).await;

        adapter.set_pending_transaction_id(0x0102);
        assert!(adapter.send_error_reply(local, 0x04, ExceptionCode::GatewayPathUnavailable, 9));

        let mut reply = [0u8; 9];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x01, 0x02, 0x00, 0x00, 0x00, 0x03, 0x09, 0x84, 0x0A]);
    }

    #[tokio::test]
    async fn test_reply_to_unknown_peer_fails() {
        let mut adapter = adapter(4).await;
        let stranger: SocketAddr = "10.0.0.1:1234".parse().unwrap();
        assert!(!adapter.send_raw_reply(stranger, &[0x03, 0x00], 1));
        assert!(!adapter.send_raw_reply(stranger, &[], 1));
    }

    #[tokio::test]
    async fn test_disconnect_event() {
        let mut adapter = adapter(4).await;
        let client = TcpStream::connect(adapter.local_addr()).await.unwrap();
        let local = client.local_addr().unwrap();
        next_events(&mut adapter, 1).await;
        drop(client);

        let events = next_events(&mut adapter, 1).await;
        assert_eq!(events, vec![NetworkEvent::PeerDisconnected(Some(local))]);
        assert_eq!(adapter.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_bad_protocol_id_closes_connection() {
        let mut adapter = adapter(4).await;
        let mut client = TcpStream::connect(adapter.local_addr()).await.unwrap();
        client
            .write_all(&[0x00, 0x01, 0x12, 0x34, 0x00, 0x02, 0x01, 0x03])
            .await
            .unwrap();

        let events = next_events(&mut adapter, 2).await;
        assert!(matches!(events[1], NetworkEvent::PeerDisconnected(_)));
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }
}
