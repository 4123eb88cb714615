//! UDP listener: one socket, a pool of receive tasks, and a guarded
//! start/stop lifecycle.
//!
//! Every receive task shares the socket and hands datagrams to the
//! `DatagramProcessor`, either on the receiving task or on a spawned one.
//! Stopping closes the socket and abandons any reassembly in progress.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use dgbus_core::config::{DgbusConfig, ListenerConfig};
use dgbus_core::{JsonPayloadDecoder, PayloadDecoder};

use crate::executor::BackgroundExecutor;
use crate::ledger::{self, ReassemblyLedger};
use crate::processor::DatagramProcessor;
use crate::router::{DispatchRouter, HandlerRegistry};
use crate::stats::DeliveryStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServerState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

impl ServerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ServerState::Starting,
            2 => ServerState::Running,
            3 => ServerState::Stopping,
            _ => ServerState::Stopped,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("socket {op} failed: {source}")]
    Socket {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

fn socket_op(op: &'static str) -> impl FnOnce(io::Error) -> ListenerError {
    move |source| ListenerError::Socket { op, source }
}

struct Running {
    socket: Arc<UdpSocket>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    expiry: JoinHandle<()>,
    local_addr: SocketAddr,
}

pub struct ListenerServer {
    config: ListenerConfig,
    state: AtomicU8,
    processor: Arc<DatagramProcessor>,
    running: Mutex<Option<Running>>,
}

impl ListenerServer {
    /// Build a server with JSON payload decoding.
    pub fn new(config: &DgbusConfig, registry: Arc<dyn HandlerRegistry>) -> Self {
        Self::with_decoder(config, registry, Arc::new(JsonPayloadDecoder))
    }

    pub fn with_decoder(
        config: &DgbusConfig,
        registry: Arc<dyn HandlerRegistry>,
        decoder: Arc<dyn PayloadDecoder>,
    ) -> Self {
        let stats = Arc::new(DeliveryStats::new());
        let executor = config
            .dispatch
            .background
            .then(|| BackgroundExecutor::new(config.dispatch.max_in_flight));
        let router = Arc::new(DispatchRouter::new(registry, executor, stats.clone()));
        let ledger = Arc::new(ReassemblyLedger::from_config(&config.reassembly));
        let processor = Arc::new(DatagramProcessor::new(ledger, router, decoder, stats));
        Self::from_parts(config.listener.clone(), processor)
    }

    pub fn from_parts(config: ListenerConfig, processor: Arc<DatagramProcessor>) -> Self {
        Self {
            config,
            state: AtomicU8::new(ServerState::Stopped as u8),
            processor,
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn stats(&self) -> &Arc<DeliveryStats> {
        self.processor.stats()
    }

    pub fn ledger(&self) -> &Arc<ReassemblyLedger> {
        self.processor.ledger()
    }

    /// Bound address while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Bind and spawn the receive tasks.
    ///
    /// Returns `Ok(false)` if the server was not stopped. On error the
    /// server is left stopped.
    pub async fn start(&self) -> Result<bool, ListenerError> {
        if !self.transition(ServerState::Stopped, ServerState::Starting) {
            tracing::debug!(state = ?self.state(), "start ignored");
            return Ok(false);
        }

        let running = match self.bind() {
            Ok(running) => running,
            Err(e) => {
                self.state.store(ServerState::Stopped as u8, Ordering::SeqCst);
                return Err(e);
            }
        };

        tracing::info!(
            addr = %running.local_addr,
            receivers = running.tasks.len(),
            packet_size = self.config.packet_size,
            "listener started"
        );
        *self.running.lock().await = Some(running);
        self.state.store(ServerState::Running as u8, Ordering::SeqCst);
        Ok(true)
    }

    /// Stop receiving and abandon in-flight reassembly.
    ///
    /// Returns `false` if the server was not running.
    pub async fn stop(&self) -> bool {
        if !self.transition(ServerState::Running, ServerState::Stopping) {
            tracing::debug!(state = ?self.state(), "stop ignored");
            return false;
        }

        let running = self.running.lock().await.take();
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            running.expiry.abort();
            for task in &running.tasks {
                task.abort();
            }
            for task in running.tasks {
                let _ = task.await;
            }
            drop(running.socket);
        }

        let abandoned = self.processor.ledger().clear();
        self.state.store(ServerState::Stopped as u8, Ordering::SeqCst);
        tracing::info!(abandoned, "listener stopped");
        true
    }

    fn transition(&self, from: ServerState, to: ServerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn bind(&self) -> Result<Running, ListenerError> {
        let addr = SocketAddr::new(self.config.bind_addr, self.config.port);
        let socket = make_socket(addr, self.config.effective_recv_buffer())?;
        let socket = Arc::new(UdpSocket::from_std(socket).map_err(socket_op("register"))?);
        let local_addr = socket.local_addr().map_err(socket_op("local_addr"))?;

        let (shutdown, _) = watch::channel(false);
        let tasks = (0..self.config.receivers.max(1))
            .map(|id| {
                tokio::spawn(receive_loop(
                    id,
                    socket.clone(),
                    self.processor.clone(),
                    shutdown.subscribe(),
                    self.config.packet_size,
                    self.config.inline_processing,
                ))
            })
            .collect();
        let expiry = tokio::spawn(ledger::expiry_loop(self.processor.ledger().clone()));

        Ok(Running {
            socket,
            shutdown,
            tasks,
            expiry,
            local_addr,
        })
    }
}

impl Drop for ListenerServer {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.expiry.abort();
            for task in &running.tasks {
                task.abort();
            }
        }
    }
}

fn make_socket(addr: SocketAddr, recv_buffer: usize) -> Result<std::net::UdpSocket, ListenerError> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(socket_op("socket()"))?;
    socket
        .set_reuse_address(true)
        .map_err(socket_op("SO_REUSEADDR"))?;
    socket
        .set_recv_buffer_size(recv_buffer)
        .map_err(socket_op("SO_RCVBUF"))?;
    socket
        .set_nonblocking(true)
        .map_err(socket_op("set_nonblocking"))?;
    socket
        .bind(&addr.into())
        .map_err(|source| ListenerError::Bind { addr, source })?;
    Ok(socket.into())
}

async fn receive_loop(
    id: usize,
    socket: Arc<UdpSocket>,
    processor: Arc<DatagramProcessor>,
    mut shutdown: watch::Receiver<bool>,
    packet_size: usize,
    inline: bool,
) {
    // One spare byte tells an oversize datagram apart from a full one.
    let mut buf = vec![0u8; packet_size + 1];

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                tracing::debug!(receiver = id, "receiver shutting down");
                return;
            }

            result = socket.recv_from(&mut buf) => {
                let (len, origin) = match result {
                    Ok(r) => r,
                    Err(e) if *shutdown.borrow() => {
                        tracing::debug!(receiver = id, error = %e, "recv_from failed during shutdown");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(receiver = id, error = %e, "recv_from failed, receiver exiting");
                        return;
                    }
                };
                if len > packet_size {
                    tracing::debug!(origin = %origin, len, "dropping oversize datagram");
                    continue;
                }

                if inline {
                    processor.handle_datagram(&buf[..len], origin).await;
                } else {
                    let datagram = Bytes::copy_from_slice(&buf[..len]);
                    let processor = processor.clone();
                    let mut shutdown = shutdown.clone();
                    // A task that starts after stop must not park on the
                    // cleared ledger.
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = shutdown.changed() => {}
                            _ = processor.handle_datagram(&datagram, origin) => {}
                        }
                    });
                }
            }
        }
    }
}
