//! The demarcation point: the UDP socket multiplexer owning the node's
//! overlay-facing port.
//!
//! Binds the first free port in a configured range, then runs a receive
//! task that feeds inbound datagrams into a channel drained by the switch.
//! Datagrams are atomic; there is no connection state.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::OverlayError;

/// Size of the receive buffer; comfortably above the overlay MTU.
const RECV_BUFFER: usize = 4096;

/// Capacity of the inbound datagram channel. Datagrams beyond this are
/// dropped, matching UDP semantics.
const INBOUND_QUEUE: usize = 1024;

/// A received datagram and its source.
pub type InboundDatagram = (SocketAddr, Vec<u8>);

/// The UDP demarcation point.
pub struct Demarc {
    socket: Mutex<Option<Arc<UdpSocket>>>,
    // 0 while unbound.
    local_port: AtomicU16,
    inbound_tx: mpsc::Sender<InboundDatagram>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Demarc {
    /// Create an unbound demarcation point and the receiver for its
    /// inbound datagrams.
    #[must_use]
    pub fn new() -> (Self, mpsc::Receiver<InboundDatagram>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (stop_tx, stop_rx) = watch::channel(false);
        (
            Self {
                socket: Mutex::new(None),
                local_port: AtomicU16::new(0),
                inbound_tx,
                stop_tx,
                stop_rx,
                task: Mutex::new(None),
            },
            inbound_rx,
        )
    }

    /// Bind the first free UDP port in `[start, start + count)` and start
    /// the receive task. Returns the bound port.
    pub async fn bind_range(&self, start: u16, count: u16) -> Result<u16, OverlayError> {
        for port in start..start.saturating_add(count) {
            match UdpSocket::bind(("0.0.0.0", port)).await {
                Ok(socket) => {
                    info!("overlay UDP bound to port {port}");
                    let socket = Arc::new(socket);
                    *self.socket.lock().await = Some(Arc::clone(&socket));
                    self.local_port.store(port, Ordering::SeqCst);

                    let tx = self.inbound_tx.clone();
                    let stop_rx = self.stop_rx.clone();
                    let handle = tokio::spawn(Self::read_loop(socket, tx, stop_rx));
                    *self.task.lock().await = Some(handle);
                    return Ok(port);
                }
                Err(e) => debug!("port {port} unavailable: {e}"),
            }
        }
        Err(OverlayError::NoBindablePort)
    }

    async fn read_loop(
        socket: Arc<UdpSocket>,
        tx: mpsc::Sender<InboundDatagram>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        let mut buf = vec![0u8; RECV_BUFFER];
        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((n, src)) => {
                            // try_send: a full queue sheds load like any
                            // other dropped datagram.
                            let _ = tx.try_send((src, buf[..n].to_vec()));
                        }
                        Err(e) => {
                            warn!("overlay recv error: {e}");
                            if *stop_rx.borrow() {
                                break;
                            }
                        }
                    }
                }
                _ = stop_rx.changed() => break,
            }
        }
    }

    /// Send a raw datagram to `target`.
    pub async fn send_to(&self, target: SocketAddr, data: &[u8]) -> Result<(), OverlayError> {
        let socket = {
            let guard = self.socket.lock().await;
            guard.as_ref().ok_or(OverlayError::NotBound)?.clone()
        };
        socket.send_to(data, target).await?;
        Ok(())
    }

    /// The bound overlay port, if bound.
    #[must_use]
    pub fn local_port(&self) -> Option<u16> {
        match self.local_port.load(Ordering::SeqCst) {
            0 => None,
            port => Some(port),
        }
    }

    /// Stop the receive task and release the socket.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        *self.socket.lock().await = None;
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
    }
}
