//! Out-of-process control client.
//!
//! Used by the companion CLI to talk to a running node over the loopback
//! control channel. The client binds a random high UDP port, runs a
//! receiver task that authenticates and decodes inbound packets and hands
//! each result line to the caller's handler, and sends commands tagged
//! with a fresh conversation id.
//!
//! The handler is invoked from the receiver task. An internal lock
//! serializes sends, received-packet handling, and close, so the handler
//! is never invoked concurrently with either.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::trace;

use ethermesh_core::constants::NODECONFIG_MAX_PACKET_SIZE;
use ethermesh_core::control::{decode_control_packet, derive_control_key, encode_control_message};

use crate::error::NodeError;

/// Lowest port the client will try to bind.
const CLIENT_PORT_FLOOR: u16 = 32768;

/// Width of the client bind port range.
const CLIENT_PORT_SPAN: u16 = 20000;

/// Bind attempts before giving up.
const CLIENT_BIND_ATTEMPTS: u32 = 5000;

/// Callback receiving `(conversation id, result line)` pairs.
pub type ResultHandler = Box<dyn Fn(u32, &str) + Send + Sync>;

struct ClientInner {
    key: [u8; 32],
    socket: Arc<UdpSocket>,
    destination: SocketAddr,
    /// Serializes sends, inbound handling, and close.
    in_use: Mutex<()>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// A handle to the loopback control channel of a running node.
pub struct LocalClient {
    inner: Arc<ClientInner>,
}

impl LocalClient {
    /// Create a client for the node listening on `control_port`, deriving
    /// the channel key from `auth_token`.
    pub async fn new(
        auth_token: &str,
        control_port: u16,
        handler: ResultHandler,
    ) -> Result<Self, NodeError> {
        let mut socket = None;
        for _ in 0..CLIENT_BIND_ATTEMPTS {
            let port = CLIENT_PORT_FLOOR + rand::thread_rng().gen_range(0..CLIENT_PORT_SPAN);
            match UdpSocket::bind((Ipv4Addr::LOCALHOST, port)).await {
                Ok(bound) => {
                    socket = Some(bound);
                    break;
                }
                Err(_) => continue,
            }
        }
        let socket = Arc::new(socket.ok_or(NodeError::ClientBind(CLIENT_BIND_ATTEMPTS))?);

        let (stop_tx, stop_rx) = watch::channel(false);
        let inner = Arc::new(ClientInner {
            key: derive_control_key(auth_token),
            socket: Arc::clone(&socket),
            destination: SocketAddr::from((Ipv4Addr::LOCALHOST, control_port)),
            in_use: Mutex::new(()),
            stop_tx,
            task: Mutex::new(None),
        });

        let task = tokio::spawn(Self::receive_loop(Arc::clone(&inner), handler, stop_rx));
        *inner.task.lock().await = Some(task);

        Ok(Self { inner })
    }

    async fn receive_loop(
        inner: Arc<ClientInner>,
        handler: ResultHandler,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let mut buf = vec![0u8; NODECONFIG_MAX_PACKET_SIZE];
        loop {
            let len = tokio::select! {
                result = inner.socket.recv_from(&mut buf) => match result {
                    Ok((len, _src)) => len,
                    Err(_) => continue,
                },
                _ = stop_rx.changed() => break,
            };

            let _guard = inner.in_use.lock().await;
            match decode_control_packet(&inner.key, &buf[..len]) {
                Ok((conversation_id, lines)) => {
                    for line in &lines {
                        handler(conversation_id, line);
                    }
                }
                Err(e) => trace!("dropping control reply: {e}"),
            }
        }
    }

    /// Send one command. Returns the conversation id its replies will
    /// carry, or 0 if the command could not be encoded or sent.
    pub async fn send(&self, command: &str) -> u32 {
        let _guard = self.inner.in_use.lock().await;

        let mut conversation_id: u32 = rand::thread_rng().gen();
        if conversation_id == 0 {
            conversation_id = 1;
        }

        let packets = match encode_control_message(
            &self.inner.key,
            conversation_id,
            &[command.to_string()],
        ) {
            Ok(packets) => packets,
            Err(_) => return 0,
        };
        for packet in packets {
            if self
                .inner
                .socket
                .send_to(&packet, self.inner.destination)
                .await
                .is_err()
            {
                return 0;
            }
        }
        conversation_id
    }

    /// Stop the receiver and release the socket. The handler is not
    /// invoked after this returns.
    pub async fn close(&self) {
        let _ = self.inner.stop_tx.send(true);
        let task = self.inner.task.lock().await.take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let _guard = self.inner.in_use.lock().await;
    }
}

impl Drop for LocalClient {
    fn drop(&mut self) {
        // Best effort: wake the receiver so it exits promptly.
        let _ = self.inner.stop_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// A stand-in control server: one socket that records requests and can
    /// send canned replies.
    async fn fake_server() -> (Arc<UdpSocket>, u16) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        (Arc::new(socket), port)
    }

    fn collector() -> (ResultHandler, Arc<StdMutex<Vec<(u32, String)>>>) {
        let seen: Arc<StdMutex<Vec<(u32, String)>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (
            Box::new(move |conv, line| sink.lock().unwrap().push((conv, line.to_string()))),
            seen,
        )
    }

    #[tokio::test]
    async fn send_emits_one_authenticated_packet() {
        let (server, port) = fake_server().await;
        let (handler, _seen) = collector();
        let client = LocalClient::new("token-a", port, handler).await.unwrap();

        let conv = client.send("info").await;
        assert_ne!(conv, 0);

        let key = derive_control_key("token-a");
        let mut buf = vec![0u8; NODECONFIG_MAX_PACKET_SIZE];
        let (len, _) = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            server.recv_from(&mut buf),
        )
        .await
        .expect("timed out")
        .unwrap();

        let (decoded_conv, lines) = decode_control_packet(&key, &buf[..len]).unwrap();
        assert_eq!(decoded_conv, conv);
        assert_eq!(lines, vec!["info".to_string()]);

        client.close().await;
    }

    #[tokio::test]
    async fn replies_reach_the_handler_in_order() {
        let (server, port) = fake_server().await;
        let (handler, seen) = collector();
        let client = LocalClient::new("token-b", port, handler).await.unwrap();

        let conv = client.send("listpeers").await;

        // Receive the request so we know the client's port, then reply.
        let key = derive_control_key("token-b");
        let mut buf = vec![0u8; NODECONFIG_MAX_PACKET_SIZE];
        let (_, client_addr) = server.recv_from(&mut buf).await.unwrap();

        let replies: Vec<String> = (0..5).map(|i| format!("200 listpeers row {i}")).collect();
        for packet in encode_control_message(&key, conv, &replies).unwrap() {
            server.send_to(&packet, client_addr).await.unwrap();
        }

        for _ in 0..50 {
            if seen.lock().unwrap().len() == replies.len() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        let received = seen.lock().unwrap().clone();
        assert_eq!(
            received,
            replies
                .iter()
                .map(|l| (conv, l.clone()))
                .collect::<Vec<_>>()
        );

        client.close().await;
    }

    #[tokio::test]
    async fn conversation_ids_are_nonzero() {
        let (_server, port) = fake_server().await;
        let (handler, _seen) = collector();
        let client = LocalClient::new("token-c", port, handler).await.unwrap();
        for _ in 0..64 {
            assert_ne!(client.send("info").await, 0);
        }
        client.close().await;
    }

    #[tokio::test]
    async fn oversize_command_returns_zero() {
        let (_server, port) = fake_server().await;
        let (handler, _seen) = collector();
        let client = LocalClient::new("token-d", port, handler).await.unwrap();
        let huge = "x".repeat(NODECONFIG_MAX_PACKET_SIZE);
        assert_eq!(client.send(&huge).await, 0);
        client.close().await;
    }

    #[tokio::test]
    async fn handler_is_silent_after_close() {
        let (server, port) = fake_server().await;
        let (handler, seen) = collector();
        let client = LocalClient::new("token-e", port, handler).await.unwrap();

        let conv = client.send("info").await;
        let mut buf = vec![0u8; NODECONFIG_MAX_PACKET_SIZE];
        let (_, client_addr) = server.recv_from(&mut buf).await.unwrap();

        client.close().await;

        let key = derive_control_key("token-e");
        let packet = encode_control_message(&key, conv, &["late".to_string()])
            .unwrap()
            .remove(0);
        server.send_to(&packet, client_addr).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(seen.lock().unwrap().is_empty());
    }
}
