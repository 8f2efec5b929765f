//! Async driver for one gateway session.
//!
//! A single task owns the connection, the state machine, the heartbeat timer
//! and the dispatcher. Commands from the outside arrive over a channel and
//! are serviced between frames, so sequence updates, heartbeats and sends
//! never race each other.

use crate::core::cache::SharedCache;
use crate::core::config::ClientConfig;
use crate::core::errors::ClientError;
use crate::core::kernel::codec::WsCodec;
use crate::core::kernel::rate_limit::GatewaySendLimiter;
use crate::core::kernel::rest::ReqwestRest;
use crate::core::kernel::ws::{TransportEvent, WsConnection, WsConnector};
use crate::gateway::codec::GatewayCodec;
use crate::gateway::dispatcher::{CallbackTable, Dispatcher, EventContext};
use crate::gateway::heartbeat::{next_tick, Heartbeat};
use crate::gateway::machine::{Action, SessionMachine, SessionState, SessionStatus};
use crate::gateway::protocol::GatewayPayload;
use crate::gateway::url::GatewayUrlCache;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::Retry;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, instrument, warn};

/// Close code used when we drop a connection we intend to resume.
/// Normal closure (1000) would invalidate the session server-side.
const RESUMABLE_CLOSE: u16 = 4000;
const COMMAND_BUFFER: usize = 64;

/// Requests serviced by the session task
#[derive(Debug)]
pub enum SessionCommand {
    /// Send a frame through the gateway send limiter
    Send {
        payload: GatewayPayload,
        reply: oneshot::Sender<Result<(), ClientError>>,
    },
    Disconnect { reply: oneshot::Sender<()> },
}

/// Cloneable handle for talking to a running session
#[derive(Debug, Clone)]
pub struct GatewayHandle {
    commands: mpsc::Sender<SessionCommand>,
}

impl GatewayHandle {
    pub fn new(commands: mpsc::Sender<SessionCommand>) -> Self {
        Self { commands }
    }

    /// Send a frame on the current connection
    pub async fn send(&self, payload: GatewayPayload) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Send { payload, reply })
            .await
            .map_err(|_| ClientError::SessionClosed)?;
        rx.await.map_err(|_| ClientError::SessionClosed)?
    }

    /// Close the connection and stop the session; no reconnect follows
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Disconnect { reply })
            .await
            .map_err(|_| ClientError::SessionClosed)?;
        rx.await.map_err(|_| ClientError::SessionClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Why a connection ended
#[derive(Debug)]
enum LoopExit {
    Shutdown,
    Reconnect { delay: Duration },
    Fatal { code: u16, reason: String },
}

/// What the session needs to open a connection
struct Link {
    config: Arc<ClientConfig>,
    connector: Arc<dyn WsConnector>,
    rest: ReqwestRest,
    urls: Arc<GatewayUrlCache>,
}

impl Link {
    async fn try_connect(&self) -> Result<WsConnection, ClientError> {
        let url = self.urls.resolve(&self.rest, &self.config).await?;
        match self.connector.connect(&url).await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                warn!(url = %url, error = %e, "Gateway connect failed");
                // Looked up again on the next attempt
                self.urls.invalidate(&self.config).await;
                Err(e)
            }
        }
    }
}

pub struct GatewaySession {
    link: Link,
    callbacks: Arc<CallbackTable>,
    cache: SharedCache,
    handle: GatewayHandle,
    commands: mpsc::Receiver<SessionCommand>,
    status: watch::Sender<SessionStatus>,
}

impl std::fmt::Debug for GatewaySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewaySession")
            .field("shard", &[self.link.config.shard_index, self.link.config.shard_count])
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

impl GatewaySession {
    pub fn new(
        config: Arc<ClientConfig>,
        connector: Arc<dyn WsConnector>,
        rest: ReqwestRest,
        callbacks: Arc<CallbackTable>,
        cache: SharedCache,
    ) -> (Self, GatewayHandle, watch::Receiver<SessionStatus>) {
        let (tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let handle = GatewayHandle::new(tx);
        let (status, status_rx) = watch::channel(SessionStatus::default());
        let session = Self {
            link: Link {
                config,
                connector,
                rest,
                urls: Arc::new(GatewayUrlCache::new()),
            },
            callbacks,
            cache,
            handle: handle.clone(),
            commands,
            status,
        };
        (session, handle, status_rx)
    }

    /// Share a gateway URL cache between sessions
    pub fn with_url_cache(mut self, urls: Arc<GatewayUrlCache>) -> Self {
        self.link.urls = urls;
        self
    }

    /// Run until disconnected or a fatal close.
    ///
    /// A fatal close exits the process when `exit_on_fatal_close` is set;
    /// otherwise it is returned as `ClientError::FatalClose`.
    #[instrument(skip(self), fields(shard = ?[self.link.config.shard_index, self.link.config.shard_count]))]
    pub async fn run(mut self) -> Result<(), ClientError> {
        let config = Arc::clone(&self.link.config);
        let dispatcher = Dispatcher::new(
            Arc::clone(&self.callbacks),
            EventContext {
                shard: [config.shard_index, config.shard_count],
                cache: self.cache.clone(),
                rest: self.link.rest.clone(),
                gateway: self.handle.clone(),
            },
        );
        let mut machine = SessionMachine::new(Arc::clone(&config));

        let result = loop {
            machine.on_connecting();
            self.publish(&machine);

            let Some(conn) = self.open_connection(machine.reconnect_delay()).await else {
                break Ok(());
            };
            machine.on_connected();
            self.publish(&machine);

            match self.drive(&mut machine, conn, &dispatcher).await {
                LoopExit::Shutdown => break Ok(()),
                LoopExit::Fatal { code, reason } => {
                    error!(code, reason = %reason, "Gateway closed with a fatal code");
                    if config.exit_on_fatal_close {
                        std::process::exit(1);
                    }
                    break Err(ClientError::FatalClose { code, reason });
                }
                LoopExit::Reconnect { delay } => {
                    machine = machine.carry_over();
                    self.publish(&machine);
                    if !self.sleep_or_shutdown(delay).await {
                        break Ok(());
                    }
                }
            }
        };

        self.publish(&machine.carry_over());
        // Callbacks still queued may send; they must fail rather than wait
        self.refuse_pending_commands();
        if let Err(e) = dispatcher.close().await {
            warn!(error = %e, "Callback worker ended abnormally");
        }
        info!("Gateway session stopped");
        result
    }

    /// Close the command channel and answer everything still buffered
    fn refuse_pending_commands(&mut self) {
        self.commands.close();
        while let Ok(cmd) = self.commands.try_recv() {
            match cmd {
                SessionCommand::Send { reply, .. } => {
                    let _ = reply.send(Err(ClientError::SessionClosed));
                }
                SessionCommand::Disconnect { reply } => {
                    let _ = reply.send(());
                }
            }
        }
    }

    fn publish(&self, machine: &SessionMachine) {
        self.status.send_replace(machine.status());
    }

    /// Connect, retrying every `delay` until it succeeds or a disconnect
    /// is requested
    async fn open_connection(&mut self, delay: Duration) -> Option<WsConnection> {
        let link = &self.link;
        let connect = Retry::start(FixedInterval::new(delay), || link.try_connect());
        tokio::pin!(connect);

        loop {
            tokio::select! {
                res = &mut connect => {
                    // FixedInterval never runs out, so the retry only ends on success
                    return res.ok();
                }
                cmd = self.commands.recv() => {
                    if !reject_while_disconnected(cmd) {
                        return None;
                    }
                }
            }
        }
    }

    /// Wait out `delay`; false if a disconnect was requested meanwhile
    async fn sleep_or_shutdown(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => return true,
                cmd = self.commands.recv() => {
                    if !reject_while_disconnected(cmd) {
                        return false;
                    }
                }
            }
        }
    }

    async fn drive(
        &mut self,
        machine: &mut SessionMachine,
        conn: WsConnection,
        dispatcher: &Dispatcher,
    ) -> LoopExit {
        let WsConnection {
            outbound,
            mut inbound,
        } = conn;
        let config = Arc::clone(&self.link.config);
        let mut codec = GatewayCodec::new(config.compress);
        codec.reset();
        let mut limiter = GatewaySendLimiter::new(config.gateway_send);
        let mut heartbeat: Option<Heartbeat> = None;

        loop {
            let exit = tokio::select! {
                biased;

                cmd = self.commands.recv() => match cmd {
                    Some(SessionCommand::Send { payload, reply }) => {
                        let result = if machine.state() == SessionState::Connected {
                            match limiter.try_acquire() {
                                Ok(()) => send_frame(&outbound, &codec, &payload).await,
                                Err(e) => Err(e),
                            }
                        } else {
                            Err(ClientError::NetworkError("Session is not connected".to_string()))
                        };
                        let _ = reply.send(result);
                        None
                    }
                    Some(SessionCommand::Disconnect { reply }) => {
                        info!("Disconnect requested");
                        close_with(&outbound, WsCloseCode::Normal).await;
                        let _ = reply.send(());
                        Some(LoopExit::Shutdown)
                    }
                    None => {
                        close_with(&outbound, WsCloseCode::Normal).await;
                        Some(LoopExit::Shutdown)
                    }
                },

                event = inbound.recv() => match event {
                    Some(TransportEvent::Text(text)) => {
                        self.on_frame(machine, &mut codec, &outbound, &mut heartbeat, dispatcher, Message::Text(text)).await
                    }
                    Some(TransportEvent::Binary(data)) => {
                        self.on_frame(machine, &mut codec, &outbound, &mut heartbeat, dispatcher, Message::Binary(data)).await
                    }
                    Some(TransportEvent::Closed { code, reason }) => {
                        Some(exit_for(machine.on_close(code, &reason)))
                    }
                    Some(TransportEvent::Error(e)) => {
                        warn!(error = %e, "Transport error");
                        Some(exit_for(machine.on_close(None, &e)))
                    }
                    None => Some(exit_for(machine.on_close(None, "transport ended"))),
                },

                Some(_) = next_tick(&mut heartbeat) => {
                    let payload = machine.heartbeat_payload();
                    debug!(seq = ?machine.seq(), "Sending heartbeat");
                    match send_frame(&outbound, &codec, &payload).await {
                        Ok(()) => None,
                        Err(e) => {
                            warn!(error = %e, "Heartbeat send failed");
                            Some(exit_for(machine.on_close(None, "heartbeat send failed")))
                        }
                    }
                }
            };

            self.publish(machine);
            if let Some(exit) = exit {
                return exit;
            }
        }
    }

    /// Decode one frame and carry out the resulting actions
    async fn on_frame(
        &self,
        machine: &mut SessionMachine,
        codec: &mut GatewayCodec,
        outbound: &mpsc::Sender<Message>,
        heartbeat: &mut Option<Heartbeat>,
        dispatcher: &Dispatcher,
        frame: Message,
    ) -> Option<LoopExit> {
        let payload = match codec.decode_message(frame) {
            Ok(Some(payload)) => payload,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Frame dropped");
                return None;
            }
        };

        for action in machine.on_payload(payload) {
            match action {
                Action::Send(payload) => {
                    if let Err(e) = send_frame(outbound, codec, &payload).await {
                        warn!(error = %e, "Handshake send failed");
                        return Some(exit_for(machine.on_close(None, "send failed")));
                    }
                }
                Action::StartHeartbeat(interval) => {
                    *heartbeat = Some(Heartbeat::start(interval));
                }
                Action::StopHeartbeat => {
                    *heartbeat = None;
                }
                Action::Dispatch(event) => dispatcher.dispatch(event),
                Action::Reconnect { delay, .. } => {
                    close_with(outbound, WsCloseCode::from(RESUMABLE_CLOSE)).await;
                    return Some(LoopExit::Reconnect { delay });
                }
                Action::Fatal { code, reason } => return Some(LoopExit::Fatal { code, reason }),
            }
        }
        None
    }
}

/// Answer a command received while no connection is open.
/// Returns false when the session should stop.
fn reject_while_disconnected(cmd: Option<SessionCommand>) -> bool {
    match cmd {
        Some(SessionCommand::Send { reply, .. }) => {
            let _ = reply.send(Err(ClientError::NetworkError(
                "Session is not connected".to_string(),
            )));
            true
        }
        Some(SessionCommand::Disconnect { reply }) => {
            let _ = reply.send(());
            false
        }
        None => false,
    }
}

fn exit_for(action: Action) -> LoopExit {
    match action {
        Action::Fatal { code, reason } => LoopExit::Fatal { code, reason },
        Action::Reconnect { delay, .. } => LoopExit::Reconnect { delay },
        other => {
            warn!(?other, "Unexpected close action, reconnecting");
            LoopExit::Reconnect {
                delay: Duration::ZERO,
            }
        }
    }
}

async fn send_frame(
    outbound: &mpsc::Sender<Message>,
    codec: &GatewayCodec,
    payload: &GatewayPayload,
) -> Result<(), ClientError> {
    let message = codec.encode_message(payload)?;
    outbound
        .send(message)
        .await
        .map_err(|_| ClientError::NetworkError("Connection writer closed".to_string()))
}

async fn close_with(outbound: &mpsc::Sender<Message>, code: WsCloseCode) {
    let frame = CloseFrame {
        code,
        reason: "".into(),
    };
    if outbound.send(Message::Close(Some(frame))).await.is_err() {
        debug!("Connection already closed");
    }
}
