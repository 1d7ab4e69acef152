//! Start gating and command lifecycle for the operator console.
//!
//! The surface owns the three signals that decide whether "start" is allowed: the
//! agent indicator fed by the live channel, the in-flight command, and the current
//! selection. The predicate is re-derived from them on every query.

use crate::channel::{ChannelEvent, ChannelState, CloseReason};
use crate::gateway::{CommandDispatch, CommandGateway};
use chrono::Utc;
use opsdeck_core::{
    command::DispatchError, AgentCommand, LogBuffer, Resource, SelectionStore, StatusEvent,
};
use serde_json::Value;
use std::{fmt, sync::Arc, time::Duration};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartBlocker {
    EmptySelection,
    AgentDisconnected,
    CommandInFlight,
}

impl fmt::Display for StartBlocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartBlocker::EmptySelection => f.write_str("empty selection"),
            StartBlocker::AgentDisconnected => f.write_str("agent disconnected"),
            StartBlocker::CommandInFlight => f.write_str("command in flight"),
        }
    }
}

/// Operator-facing result of a settled command. Kept apart from channel status.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Succeeded { command: String, payload: Value },
    Failed { command: String, reason: String },
}

impl Notice {
    pub fn command(&self) -> &str {
        match self {
            Notice::Succeeded { command, .. } | Notice::Failed { command, .. } => command,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Notice::Succeeded { .. })
    }
}

#[derive(Debug)]
pub struct CommandOutcome {
    pub command: String,
    pub result: Result<Value, DispatchError>,
}

pub struct ControlSurface<D: CommandDispatch = CommandGateway> {
    dispatcher: Arc<D>,
    token: String,
    command_timeout: Duration,
    selection: SelectionStore,
    agent_connected: bool,
    channel_state: ChannelState,
    log: LogBuffer,
    in_flight: Option<String>,
    commands: JoinSet<CommandOutcome>,
    notice: Option<Notice>,
}

impl<D: CommandDispatch> ControlSurface<D> {
    pub fn new(dispatcher: Arc<D>, token: impl Into<String>, command_timeout: Duration) -> Self {
        Self {
            dispatcher,
            token: token.into(),
            command_timeout,
            selection: SelectionStore::new(),
            agent_connected: false,
            channel_state: ChannelState::Connecting,
            log: LogBuffer::default(),
            in_flight: None,
            commands: JoinSet::new(),
            notice: None,
        }
    }

    pub fn can_start(&self) -> bool {
        self.start_blocker().is_none()
    }

    /// First reason start is unavailable, checked in the order the operator can fix them.
    pub fn start_blocker(&self) -> Option<StartBlocker> {
        if self.selection.is_empty() {
            Some(StartBlocker::EmptySelection)
        } else if !self.agent_connected {
            Some(StartBlocker::AgentDisconnected)
        } else if self.in_flight.is_some() {
            Some(StartBlocker::CommandInFlight)
        } else {
            None
        }
    }

    pub fn start_hint(&self) -> String {
        match self.start_blocker() {
            Some(blocker) => blocker.to_string(),
            None => "ready to start".to_string(),
        }
    }

    /// Dispatch `start_script` with a payload built from the selection as it is now.
    pub fn request_start(&mut self) -> Result<(), StartBlocker> {
        if let Some(blocker) = self.start_blocker() {
            debug!(event = "start_blocked", reason = %blocker);
            return Err(blocker);
        }
        let payload = self.selection.build_payload();
        info!(event = "start_requested", items = payload.item_ids.len());
        self.spawn_command(AgentCommand::StartScript(payload));
        Ok(())
    }

    /// Dispatch any agent command. Only one command runs at a time; the channel state
    /// is not consulted so diagnostics stay reachable while the agent is away.
    pub fn run_command(&mut self, command: AgentCommand) -> Result<(), StartBlocker> {
        if self.in_flight.is_some() {
            return Err(StartBlocker::CommandInFlight);
        }
        self.spawn_command(command);
        Ok(())
    }

    fn spawn_command(&mut self, command: AgentCommand) {
        let name = command.name().to_string();
        let args = command.args();
        let timeout = command.timeout_or(self.command_timeout);
        let token = self.token.clone();
        let dispatcher = Arc::clone(&self.dispatcher);
        self.in_flight = Some(name.clone());
        self.commands.spawn(async move {
            let result = dispatcher.dispatch(&name, args, &token, timeout).await;
            CommandOutcome {
                command: name,
                result,
            }
        });
    }

    pub fn in_flight(&self) -> Option<&str> {
        self.in_flight.as_deref()
    }

    pub fn has_pending(&self) -> bool {
        !self.commands.is_empty()
    }

    /// Wait for the running command. Returns `None` when nothing is running.
    pub async fn next_settlement(&mut self) -> Option<Result<CommandOutcome, JoinError>> {
        self.commands.join_next().await
    }

    /// Record a settled command. The in-flight flag is cleared whatever the outcome.
    pub fn settle(&mut self, settled: Result<CommandOutcome, JoinError>) -> &Notice {
        let in_flight = self.in_flight.take();
        let notice = match settled {
            Ok(CommandOutcome {
                command,
                result: Ok(payload),
            }) => {
                info!(event = "command_succeeded", command = %command);
                Notice::Succeeded { command, payload }
            }
            Ok(CommandOutcome {
                command,
                result: Err(err),
            }) => {
                warn!(event = "command_failed", command = %command, error = %err);
                Notice::Failed {
                    command,
                    reason: err.to_string(),
                }
            }
            Err(err) => {
                let command = in_flight.unwrap_or_else(|| "command".to_string());
                warn!(event = "command_task_failed", command = %command, error = %err);
                Notice::Failed {
                    command,
                    reason: format!("command task failed: {err}"),
                }
            }
        };
        self.notice.insert(notice)
    }

    /// Run one start to completion and return its notice.
    pub async fn start(&mut self) -> Result<Notice, StartBlocker> {
        self.request_start()?;
        self.await_command().await
    }

    pub async fn execute(&mut self, command: AgentCommand) -> Result<Notice, StartBlocker> {
        self.run_command(command)?;
        self.await_command().await
    }

    async fn await_command(&mut self) -> Result<Notice, StartBlocker> {
        match self.next_settlement().await {
            Some(settled) => Ok(self.settle(settled).clone()),
            None => Err(StartBlocker::CommandInFlight),
        }
    }

    pub fn notice(&self) -> Option<&Notice> {
        self.notice.as_ref()
    }

    pub fn take_notice(&mut self) -> Option<Notice> {
        self.notice.take()
    }

    /// Fold a channel event into the status indicator and the log. Returns true when
    /// the agent indicator changed.
    pub fn apply_channel_event(&mut self, event: &ChannelEvent) -> bool {
        let before = self.agent_connected;
        match event {
            ChannelEvent::Opened => {
                self.channel_state = ChannelState::Open;
            }
            ChannelEvent::Frame(frame) => {
                if let Some(connected) = StatusEvent::classify(frame).agent_connected() {
                    self.agent_connected = connected;
                }
                self.log.record(frame, Utc::now());
            }
            ChannelEvent::Closed(reason) => {
                self.channel_state = ChannelState::Closed {
                    retryable: !matches!(reason, CloseReason::Stopped),
                };
                self.agent_connected = false;
            }
        }
        before != self.agent_connected
    }

    pub fn set_channel_state(&mut self, state: ChannelState) {
        self.channel_state = state;
        if state != ChannelState::Open {
            self.agent_connected = false;
        }
    }

    pub fn agent_connected(&self) -> bool {
        self.agent_connected
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel_state
    }

    /// Whole-list replacement from the picker or persisted hydration. Returns how many
    /// duplicate ids were dropped.
    pub fn replace_selection(&mut self, items: Vec<Resource>) -> usize {
        let dropped = self.selection.replace(items);
        if dropped > 0 {
            debug!(event = "selection_duplicates_dropped", dropped);
        }
        dropped
    }

    pub fn selection(&self) -> &SelectionStore {
        &self.selection
    }

    pub fn log(&self) -> &LogBuffer {
        &self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use opsdeck_core::{command::START_SCRIPT, Frame};
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    #[derive(Debug, Clone, PartialEq)]
    struct Call {
        command: String,
        args: Value,
        token: String,
        timeout: Duration,
    }

    struct FakeDispatch {
        calls: Mutex<Vec<Call>>,
        reply: Mutex<Result<Value, DispatchError>>,
        gate: Option<Arc<Notify>>,
        panic: bool,
    }

    impl FakeDispatch {
        fn replying(reply: Result<Value, DispatchError>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                reply: Mutex::new(reply),
                gate: None,
                panic: false,
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandDispatch for FakeDispatch {
        async fn dispatch(
            &self,
            command: &str,
            args: Value,
            token: &str,
            timeout: Duration,
        ) -> Result<Value, DispatchError> {
            self.calls.lock().unwrap().push(Call {
                command: command.to_string(),
                args,
                token: token.to_string(),
                timeout,
            });
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.panic {
                panic!("dispatcher crashed");
            }
            self.reply.lock().unwrap().clone()
        }
    }

    fn surface(dispatch: FakeDispatch) -> (ControlSurface<FakeDispatch>, Arc<FakeDispatch>) {
        let dispatch = Arc::new(dispatch);
        let surface = ControlSurface::new(
            Arc::clone(&dispatch),
            "change-me",
            Duration::from_secs(15),
        );
        (surface, dispatch)
    }

    fn status(connected: bool) -> ChannelEvent {
        ChannelEvent::Frame(Frame::Parsed(json!({
            "type": "agent_status",
            "connected": connected
        })))
    }

    fn item(id: i64) -> Resource {
        Resource::new(id, format!("Item {id}"), format!("item-{id}")).with_level(2)
    }

    #[tokio::test]
    async fn start_succeeds_and_releases_in_flight_flag() {
        let (mut surface, dispatch) = surface(FakeDispatch::replying(Ok(json!({"ok": true}))));
        surface.apply_channel_event(&ChannelEvent::Opened);
        surface.apply_channel_event(&status(true));
        surface.replace_selection(vec![item(7)]);
        let before = surface.selection().clone();

        let notice = surface.start().await.expect("start allowed");
        assert_eq!(
            notice,
            Notice::Succeeded {
                command: START_SCRIPT.to_string(),
                payload: json!({"ok": true})
            }
        );
        assert!(surface.in_flight().is_none());
        assert_eq!(surface.selection(), &before);
        assert!(surface.can_start());

        let calls = dispatch.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].command, START_SCRIPT);
        assert_eq!(calls[0].token, "change-me");
        assert_eq!(calls[0].timeout, Duration::from_secs(15));
        assert_eq!(calls[0].args["item_ids"], json!([7]));
        assert_eq!(calls[0].args["items"][0]["order"], 0);
        assert_eq!(calls[0].args["items"][0]["name_fr"], "Item 7");
    }

    #[tokio::test]
    async fn gating_flips_with_each_condition() {
        let gate = Arc::new(Notify::new());
        let mut dispatch = FakeDispatch::replying(Ok(Value::Null));
        dispatch.gate = Some(Arc::clone(&gate));
        let (mut surface, _) = surface(dispatch);

        assert_eq!(surface.start_blocker(), Some(StartBlocker::EmptySelection));
        surface.replace_selection(vec![item(1), item(2)]);
        assert_eq!(surface.start_blocker(), Some(StartBlocker::AgentDisconnected));
        assert!(surface.apply_channel_event(&status(true)));
        assert!(surface.can_start());

        surface.request_start().expect("first start");
        assert_eq!(surface.start_blocker(), Some(StartBlocker::CommandInFlight));
        assert_eq!(surface.request_start(), Err(StartBlocker::CommandInFlight));
        assert_eq!(surface.start_hint(), "command in flight");

        gate.notify_one();
        let settled = surface.next_settlement().await.expect("pending command");
        assert!(surface.settle(settled).is_success());
        assert!(surface.can_start());

        assert!(surface.apply_channel_event(&status(false)));
        assert_eq!(surface.start_hint(), "agent disconnected");
        surface.apply_channel_event(&status(true));
        surface.replace_selection(Vec::new());
        assert_eq!(surface.start_hint(), "empty selection");
    }

    #[tokio::test]
    async fn failure_is_reported_and_flag_cleared() {
        let (mut surface, _) = surface(FakeDispatch::replying(Err(DispatchError::TimedOut(
            Duration::from_secs(15),
        ))));
        surface.apply_channel_event(&status(true));
        surface.replace_selection(vec![item(3)]);

        let notice = surface.start().await.expect("dispatched");
        assert_eq!(
            notice,
            Notice::Failed {
                command: START_SCRIPT.to_string(),
                reason: "request timed out after 15000ms".to_string()
            }
        );
        assert!(surface.in_flight().is_none());
        assert!(surface.can_start());
    }

    #[tokio::test]
    async fn crashed_command_task_still_clears_flag() {
        let mut dispatch = FakeDispatch::replying(Ok(Value::Null));
        dispatch.panic = true;
        let (mut surface, _) = surface(dispatch);
        surface.apply_channel_event(&status(true));
        surface.replace_selection(vec![item(3)]);

        let notice = surface.start().await.expect("dispatched");
        assert!(!notice.is_success());
        assert_eq!(notice.command(), START_SCRIPT);
        assert!(surface.in_flight().is_none());
    }

    #[tokio::test]
    async fn channel_close_resets_agent_indicator() {
        let (mut surface, _) = surface(FakeDispatch::replying(Ok(Value::Null)));
        surface.apply_channel_event(&ChannelEvent::Opened);
        surface.apply_channel_event(&status(true));
        assert!(surface.agent_connected());

        let changed = surface.apply_channel_event(&ChannelEvent::Closed(CloseReason::Ended));
        assert!(changed);
        assert!(!surface.agent_connected());
        assert_eq!(surface.channel_state().label(), "reconnecting");
    }

    #[tokio::test]
    async fn local_close_is_shown_as_terminal() {
        let (mut surface, _) = surface(FakeDispatch::replying(Ok(Value::Null)));
        surface.apply_channel_event(&ChannelEvent::Opened);
        surface.apply_channel_event(&status(true));

        assert!(surface.apply_channel_event(&ChannelEvent::Closed(CloseReason::Stopped)));
        assert_eq!(surface.channel_state(), ChannelState::Closed { retryable: false });
        assert_eq!(surface.channel_state().label(), "closed");
        assert!(!surface.agent_connected());
    }

    #[tokio::test]
    async fn configured_timeout_applies_even_when_shorter() {
        let dispatch = Arc::new(FakeDispatch::replying(Ok(Value::Null)));
        let mut surface =
            ControlSurface::new(Arc::clone(&dispatch), "change-me", Duration::from_secs(2));
        surface.apply_channel_event(&status(true));
        surface.replace_selection(vec![item(5)]);

        surface.start().await.expect("start allowed");
        surface
            .execute(AgentCommand::screenshot())
            .await
            .expect("screenshot allowed");

        let calls = dispatch.calls();
        assert_eq!(calls[0].command, START_SCRIPT);
        assert_eq!(calls[0].timeout, Duration::from_secs(2));
        assert_eq!(calls[1].timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn every_frame_is_logged_most_recent_first() {
        let (mut surface, _) = surface(FakeDispatch::replying(Ok(Value::Null)));
        surface.apply_channel_event(&status(true));
        surface.apply_channel_event(&ChannelEvent::Frame(Frame::Raw("heartbeat".to_string())));
        surface.apply_channel_event(&ChannelEvent::Frame(Frame::Parsed(json!({
            "type": "progress",
            "step": 4
        }))));

        let lines: Vec<&str> = surface.log().iter().map(|entry| entry.line.as_str()).collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("progress"));
        assert_eq!(lines[1], "\"heartbeat\"");
        assert!(lines[2].contains("agent_status"));
        assert!(surface.agent_connected());
    }

    #[tokio::test]
    async fn diagnostic_commands_run_while_agent_is_away() {
        let (mut surface, dispatch) =
            surface(FakeDispatch::replying(Ok(json!({"content": "rate = 2"}))));
        let notice = surface
            .execute(AgentCommand::screenshot())
            .await
            .expect("not gated by the channel");
        assert!(notice.is_success());
        assert_eq!(dispatch.calls()[0].timeout, Duration::from_secs(30));
        assert_eq!(surface.take_notice(), Some(notice));
        assert!(surface.notice().is_none());
    }
}
