//! Live status channel to the backend.
//!
//! One task owns the connection and feeds [`ChannelEvent`]s into an mpsc queue in
//! arrival order. Losing the connection is never an error for the caller: it becomes a
//! `Closed` event followed by a reconnect on the [`RetryPolicy`] schedule, until the
//! handle is closed.

use crate::config::{ws_url, ConfigError};
use async_trait::async_trait;
use futures_util::StreamExt;
use opsdeck_core::{Frame, RetryPolicy};
use serde_json::Value;
use std::{fmt, sync::Arc};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Remote { code: u16, reason: String },
    Transport(String),
    ConnectFailed(String),
    Ended,
    Stopped,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Remote { code, reason } if reason.is_empty() => {
                write!(f, "closed by server ({code})")
            }
            CloseReason::Remote { code, reason } => write!(f, "closed by server ({code}: {reason})"),
            CloseReason::Transport(err) => write!(f, "transport error: {err}"),
            CloseReason::ConnectFailed(err) => write!(f, "connect failed: {err}"),
            CloseReason::Ended => f.write_str("stream ended"),
            CloseReason::Stopped => f.write_str("closed locally"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Opened,
    Frame(Frame<Value>),
    Closed(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed { retryable: bool },
}

impl ChannelState {
    pub fn label(&self) -> &'static str {
        match self {
            ChannelState::Connecting => "connecting",
            ChannelState::Open => "open",
            ChannelState::Closed { retryable: true } => "reconnecting",
            ChannelState::Closed { retryable: false } => "closed",
        }
    }
}

pub enum Inbound {
    Text(String),
    Closed(CloseReason),
}

#[async_trait]
pub trait Connection: Send {
    /// Next text frame, or the reason the connection ended.
    async fn recv(&mut self) -> Inbound;
    async fn close(&mut self);
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection + 'static;

    async fn connect(&self, url: &Url) -> Result<Self::Connection, String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connector for WsConnector {
    type Connection = WsConnection;

    async fn connect(&self, url: &Url) -> Result<WsConnection, String> {
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| err.to_string())?;
        Ok(WsConnection { stream })
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn recv(&mut self) -> Inbound {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Inbound::Text(text),
                Some(Ok(Message::Binary(bytes))) => {
                    return Inbound::Text(String::from_utf8_lossy(&bytes).into_owned())
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|frame| (u16::from(frame.code), frame.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    return Inbound::Closed(CloseReason::Remote { code, reason });
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Inbound::Closed(CloseReason::Transport(err.to_string())),
                None => return Inbound::Closed(CloseReason::Ended),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self.stream.close(None).await {
            debug!("channel_close_error: {err}");
        }
    }
}

pub struct ConnectionManager<C: Connector = WsConnector> {
    base_url: Url,
    connector: Arc<C>,
    policy: RetryPolicy,
}

impl ConnectionManager<WsConnector> {
    pub fn websocket(base_url: Url, policy: RetryPolicy) -> Self {
        Self::new(base_url, WsConnector, policy)
    }
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(base_url: Url, connector: C, policy: RetryPolicy) -> Self {
        Self {
            base_url,
            connector: Arc::new(connector),
            policy,
        }
    }

    /// Start the channel on `path`; events are delivered to `events` until the returned
    /// handle is closed or dropped, or the receiver goes away.
    pub fn open(
        &self,
        path: &str,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Result<ChannelHandle, ConfigError> {
        let url = ws_url(&self.base_url, path)?;
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
        let task = tokio::spawn(run_channel(
            Arc::clone(&self.connector),
            url,
            self.policy,
            events,
            stop_rx,
            state_tx,
        ));
        Ok(ChannelHandle {
            stop_tx,
            state_rx,
            task: Some(task),
        })
    }
}

pub struct ChannelHandle {
    stop_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<ChannelState>,
    task: Option<JoinHandle<()>>,
}

impl ChannelHandle {
    /// Permanently stop the channel. The stopped flag is raised before the connection is
    /// torn down, so a close event racing with this call never schedules a reconnect.
    pub fn close(&self) {
        if !self.stop_tx.send_replace(true) {
            debug!(event = "channel_stop_requested");
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    pub fn state(&self) -> ChannelState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state_rx.clone()
    }

    /// Close and wait for the channel task to finish.
    pub async fn shutdown(mut self) {
        self.close();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                warn!("channel_task_join_error: {err}");
            }
        }
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_channel<C: Connector>(
    connector: Arc<C>,
    url: Url,
    policy: RetryPolicy,
    events: mpsc::Sender<ChannelEvent>,
    mut stop_rx: watch::Receiver<bool>,
    state_tx: watch::Sender<ChannelState>,
) {
    let mut attempt: u32 = 0;

    loop {
        if *stop_rx.borrow() {
            break;
        }
        state_tx.send_replace(ChannelState::Connecting);
        let connected = tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            result = connector.connect(&url) => result,
        };

        let reason = match connected {
            Ok(mut conn) => {
                attempt = 0;
                state_tx.send_replace(ChannelState::Open);
                info!(event = "channel_open", url = %url);
                if !deliver(&events, &mut stop_rx, ChannelEvent::Opened).await {
                    conn.close().await;
                    break;
                }
                loop {
                    tokio::select! {
                        biased;
                        _ = stop_rx.changed() => {
                            conn.close().await;
                            break CloseReason::Stopped;
                        }
                        inbound = conn.recv() => match inbound {
                            Inbound::Text(text) => {
                                let event = ChannelEvent::Frame(Frame::decode(&text));
                                if !deliver(&events, &mut stop_rx, event).await {
                                    conn.close().await;
                                    break CloseReason::Stopped;
                                }
                            }
                            Inbound::Closed(reason) => break reason,
                        }
                    }
                }
            }
            Err(err) => {
                warn!("channel_connect_error: {err}");
                CloseReason::ConnectFailed(err)
            }
        };

        let stopped = *stop_rx.borrow() || reason == CloseReason::Stopped;
        state_tx.send_replace(ChannelState::Closed {
            retryable: !stopped,
        });
        info!(event = "channel_closed", reason = %reason, stopped);
        if !deliver(&events, &mut stop_rx, ChannelEvent::Closed(reason)).await || stopped {
            break;
        }

        attempt = attempt.saturating_add(1);
        let Some(delay) = policy.delay_for(attempt) else {
            warn!(event = "channel_retry_exhausted", attempts = attempt - 1);
            break;
        };
        debug!(
            event = "channel_reconnect_scheduled",
            attempt,
            delay_ms = delay.as_millis() as u64
        );
        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    state_tx.send_replace(ChannelState::Closed { retryable: false });
}

/// Queue one event for the subscriber. A full queue never holds up a stop: once the
/// stop flag is raised the event is only queued if there is room for it. Returns false
/// when the channel should wind down.
async fn deliver(
    events: &mpsc::Sender<ChannelEvent>,
    stop_rx: &mut watch::Receiver<bool>,
    event: ChannelEvent,
) -> bool {
    if *stop_rx.borrow() {
        return events.try_send(event).is_ok();
    }
    tokio::select! {
        biased;
        _ = stop_rx.changed() => false,
        sent = events.send(event) => sent.is_ok(),
    }
}
