//! Tokio driver for the overlay engine.
//!
//! The [`Overlay`] is owned by a single task running [`OverlayDriver::run`].
//! Every connection gets its own task which performs the handshake I/O and
//! then shuttles raw bytes: what it reads goes to the engine task as a
//! [`DriverEvent`], what the engine wants written comes back over a
//! per-connection channel. Only the engine task touches engine state.
//!
//! Each writer holds at most one chunk at a time. Until it reports the chunk
//! flushed, output stays in the node's egress queue, which is what lets a
//! slow peer drive its queue into flow control.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use crate::connection::{Connection, Listener};
use crate::node::{NodeId, Transport};
use crate::overlay::{HandshakeOutcome, HandshakeStep, Overlay};
use crate::{current_timestamp, HostAddr, OverlayError, Result};

/// Capacity of the event channel into the engine task.
const EVENT_CHANNEL_SIZE: usize = 1024;

/// Outgoing dials in flight at once.
const MAX_PENDING_DIALS: usize = 4;

/// Seconds between node summaries in the log.
const SUMMARY_INTERVAL: u64 = 60;

/// Events sent from connection tasks to the engine task.
pub enum DriverEvent {
    /// An outgoing TCP connection attempt finished.
    Dialed {
        id: NodeId,
        result: Result<Connection>,
    },
    /// A complete handshake block arrived; the reply goes back on `reply`.
    Handshake {
        id: NodeId,
        block: String,
        reply: oneshot::Sender<HandshakeStep>,
    },
    Data {
        id: NodeId,
        data: BytesMut,
    },
    /// The writer finished the chunk it was given.
    Flushed {
        id: NodeId,
    },
    Eof {
        id: NodeId,
    },
    IoError {
        id: NodeId,
        error: String,
    },
}

/// Node transport backed by a connection task.
struct TaskTransport {
    handle: AbortHandle,
}

impl Transport for TaskTransport {
    fn close(&mut self, reason: &str) {
        trace!("Closing connection task: {}", reason);
        self.handle.abort();
    }
}

/// Driver-side state of one connection.
struct Link {
    output: mpsc::Sender<Bytes>,
    writing: bool,
}

pub struct OverlayDriver {
    overlay: Overlay,
    listener: Option<Listener>,
    links: HashMap<NodeId, Link>,
    /// Nodes whose TCP connect is still in flight.
    dialing: HashSet<NodeId>,
    events_tx: mpsc::Sender<DriverEvent>,
    events_rx: mpsc::Receiver<DriverEvent>,
    last_summary: u64,
}

impl OverlayDriver {
    /// Creates the driver, binding the listener if enabled.
    pub async fn bind(overlay: Overlay) -> Result<Self> {
        let listener = if overlay.config().listen_enabled {
            let listener = Listener::bind(overlay.config().listen_addr).await?;
            info!("Listening on {}", listener.local_addr());
            Some(listener)
        } else {
            None
        };
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        Ok(Self {
            overlay,
            listener,
            links: HashMap::new(),
            dialing: HashSet::new(),
            events_tx,
            events_rx,
            last_summary: current_timestamp(),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|l| l.local_addr())
    }

    pub fn overlay(&self) -> &Overlay {
        &self.overlay
    }

    /// Runs until `shutdown` completes, then closes every node and hands
    /// the engine back.
    pub async fn run<F>(mut self, shutdown: F) -> Result<Overlay>
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => self.on_tick(),
                Some(event) = self.events_rx.recv() => self.on_event(event),
                accepted = accept(self.listener.as_ref()) => self.on_accept(accepted),
            }
            self.sync_links();
            self.flush();
        }

        self.stop().await?;
        Ok(self.overlay)
    }

    async fn stop(&mut self) -> Result<()> {
        self.overlay.begin_shutdown(current_timestamp());
        self.flush();
        // Give writers a moment to push the Byes out.
        let deadline = tokio::time::sleep(Duration::from_millis(500));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                Some(event) = self.events_rx.recv() => {
                    if let DriverEvent::Flushed { id } = event {
                        if let Some(link) = self.links.get_mut(&id) {
                            link.writing = false;
                        }
                        self.flush();
                    }
                }
            }
            if self.links.values().all(|l| !l.writing) {
                break;
            }
        }
        self.overlay.shutdown()?;
        self.links.clear();
        info!("Overlay driver stopped");
        Ok(())
    }

    fn on_tick(&mut self) {
        let now = current_timestamp();
        let removed = self.overlay.tick(now);
        if !removed.is_empty() {
            debug!("Tick removed {} nodes", removed.len());
        }
        self.dial_more(now);

        if now.saturating_sub(self.last_summary) >= SUMMARY_INTERVAL {
            self.last_summary = now;
            for snap in self.overlay.snapshots() {
                debug!(
                    "{} {} {} {:?} sent={} recv={} queue={} ({}%){}{}",
                    snap.id,
                    snap.addr,
                    snap.status,
                    snap.role,
                    snap.stats.sent,
                    snap.stats.received,
                    snap.mqueue_count,
                    snap.mqueue_percent_used,
                    if snap.in_tx_flow_control { " FC" } else { "" },
                    if snap.in_tx_swift_control { " swift" } else { "" },
                );
            }
        }
    }

    fn dial_more(&mut self, now: u64) {
        while self.dialing.len() < MAX_PENDING_DIALS {
            let Some(addr) = self.overlay.next_bootstrap_addr() else {
                break;
            };
            match self.overlay.add_outgoing(addr, now) {
                Ok(id) => self.spawn_dial(id, addr),
                Err(e) => {
                    debug!("Not dialing {}: {}", addr, e);
                    break;
                }
            }
        }
    }

    fn spawn_dial(&mut self, id: NodeId, addr: HostAddr) {
        self.dialing.insert(id);
        let timeout = self.overlay.config().connect_timeout_secs;
        let events = self.events_tx.clone();
        let handle = tokio::spawn(async move {
            let result = Connection::connect(addr, timeout).await;
            let _ = events.send(DriverEvent::Dialed { id, result }).await;
        });
        // Until the connection task takes over, removal cancels the dial.
        let transport = TaskTransport {
            handle: handle.abort_handle(),
        };
        if let Err(e) = self.overlay.attach_transport(id, Box::new(transport)) {
            warn!("Dial of {} lost its node: {}", addr, e);
        }
    }

    fn on_accept(&mut self, accepted: Result<Connection>) {
        let conn = match accepted {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                return;
            }
        };
        let addr = HostAddr::from(conn.remote_addr());
        match self.overlay.add_incoming(addr, current_timestamp()) {
            Ok(id) => self.spawn_connection(id, conn, None),
            Err(e) => debug!("Rejecting {}: {}", addr, e),
        }
    }

    fn on_event(&mut self, event: DriverEvent) {
        let now = current_timestamp();
        match event {
            DriverEvent::Dialed { id, result } => {
                self.dialing.remove(&id);
                match result {
                    Ok(conn) => match self.overlay.connection_established(id) {
                        Ok(greeting) => self.spawn_connection(id, conn, Some(greeting)),
                        Err(e) => debug!("{}: {}", id, e),
                    },
                    Err(e) => {
                        debug!("Dial of {} failed: {}", id, e);
                        self.overlay.connect_failed(id, &e, now);
                    }
                }
            }
            DriverEvent::Handshake { id, block, reply } => {
                let step = match self.overlay.handshake_block(id, &block, now) {
                    Ok(step) => step,
                    Err(e) => {
                        debug!("{}: {}", id, e);
                        HandshakeStep {
                            reply: None,
                            outcome: HandshakeOutcome::Failed,
                        }
                    }
                };
                let _ = reply.send(step);
            }
            DriverEvent::Data { id, data } => {
                if let Err(e) = self.overlay.receive_data(id, &data, now) {
                    debug!("{}: {}", id, e);
                }
            }
            DriverEvent::Flushed { id } => {
                if let Some(link) = self.links.get_mut(&id) {
                    link.writing = false;
                }
            }
            DriverEvent::Eof { id } => self.overlay.on_eof(id),
            DriverEvent::IoError { id, error } => self.overlay.on_io_error(id, &error, now),
        }
    }

    fn spawn_connection(&mut self, id: NodeId, conn: Connection, greeting: Option<String>) {
        let (output_tx, output_rx) = mpsc::channel(1);
        let events = self.events_tx.clone();
        let handshake_timeout = self.overlay.config().handshake_timeout_secs;
        let handle = tokio::spawn(async move {
            let event = match run_connection(id, conn, greeting, handshake_timeout, &events, output_rx).await {
                Ok(()) => DriverEvent::Eof { id },
                Err(e) => DriverEvent::IoError {
                    id,
                    error: e.to_string(),
                },
            };
            let _ = events.send(event).await;
        });
        let transport = TaskTransport {
            handle: handle.abort_handle(),
        };
        match self.overlay.attach_transport(id, Box::new(transport)) {
            Ok(()) => {
                self.links.insert(
                    id,
                    Link {
                        output: output_tx,
                        writing: false,
                    },
                );
            }
            Err(_) => handle.abort(),
        }
    }

    /// Forgets links and dials whose node is gone. A removed dialing node
    /// aborts its task before it can report back.
    fn sync_links(&mut self) {
        let overlay = &self.overlay;
        self.links.retain(|id, _| overlay.node(*id).is_some());
        self.dialing.retain(|id| overlay.node(*id).is_some());
    }

    /// Hands pending output to idle writers.
    fn flush(&mut self) {
        let now = current_timestamp();
        let chunk = self.overlay.config().write_chunk_size;
        for id in self.overlay.pending_output() {
            let Some(link) = self.links.get_mut(&id) else {
                continue;
            };
            if link.writing {
                continue;
            }
            match self.overlay.take_output(id, chunk, now) {
                Ok(Some(bytes)) => {
                    if link.output.try_send(bytes).is_ok() {
                        link.writing = true;
                    } else {
                        self.overlay.on_io_error(id, "writer gone", now);
                    }
                }
                Ok(None) => {}
                Err(e) => self.overlay.on_io_error(id, &e.to_string(), now),
            }
        }
    }
}

async fn accept(listener: Option<&Listener>) -> Result<Connection> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

/// Body of a connection task: handshake, then byte shuttling until EOF.
async fn run_connection(
    id: NodeId,
    mut conn: Connection,
    greeting: Option<String>,
    handshake_timeout: u64,
    events: &mpsc::Sender<DriverEvent>,
    mut output: mpsc::Receiver<Bytes>,
) -> Result<()> {
    if let Some(greeting) = greeting {
        conn.write_text(&greeting).await?;
    }
    loop {
        let block = conn.read_block(handshake_timeout).await?;
        let (reply_tx, reply_rx) = oneshot::channel();
        events
            .send(DriverEvent::Handshake {
                id,
                block,
                reply: reply_tx,
            })
            .await
            .map_err(|_| OverlayError::ChannelSend)?;
        let step = reply_rx.await.map_err(|_| OverlayError::ChannelSend)?;
        if let Some(reply) = &step.reply {
            conn.write_text(reply).await?;
        }
        match step.outcome {
            HandshakeOutcome::Continue => continue,
            HandshakeOutcome::Established => break,
            HandshakeOutcome::Failed => {
                return Err(OverlayError::ConnectionFailed(format!(
                    "{}: handshake refused",
                    conn.remote_addr()
                )))
            }
        }
    }

    let (mut reader, mut writer) = conn.into_split();
    loop {
        tokio::select! {
            chunk = reader.recv() => match chunk? {
                Some(data) => events
                    .send(DriverEvent::Data { id, data })
                    .await
                    .map_err(|_| OverlayError::ChannelSend)?,
                None => return Ok(()),
            },
            Some(bytes) = output.recv() => {
                writer.send(bytes).await?;
                events
                    .send(DriverEvent::Flushed { id })
                    .await
                    .map_err(|_| OverlayError::ChannelSend)?;
            }
        }
    }
}
