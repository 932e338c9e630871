//! Per-party call state.
//!
//! A [`CallAgent`] is driven by discrete events on one task: user commands,
//! server events and negotiation-engine events. It owns at most one
//! [`MediaCoordinator`], and every way out of a call (hang-up, reject,
//! remote end, failure) goes through [`CallAgent::teardown`], which closes
//! the coordinator and releases local media.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tandem_media::coordinator::coordinator_for;
use tandem_media::{
    CoordinatorEvent, EngineEvent, EngineEventSink, EngineFactory, MediaCoordinator,
    MediaDevices, NegotiationRole, SignalSink, TrackKind,
};
use tandem_shared::{CallError, CallId, CallRecord, MediaKind, ServerEvent, UserId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::DEFAULT_NEGOTIATION_TIMEOUT_SECS;
use crate::error::{ClientError, Result};

/// The server-side call operations an agent needs.
#[async_trait]
pub trait CallControl: Send + Sync {
    async fn initiate(&self, receiver: UserId, media_kind: MediaKind) -> Result<CallRecord>;
    async fn answer(&self, call_id: CallId) -> Result<CallRecord>;
    async fn reject(&self, call_id: CallId) -> Result<()>;
    async fn end(&self, call_id: CallId) -> Result<CallRecord>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Outgoing(CallRecord),
    Incoming(CallRecord),
    InCall {
        call: CallRecord,
        media_connected: bool,
    },
}

impl AgentState {
    pub fn call(&self) -> Option<&CallRecord> {
        match self {
            AgentState::Idle => None,
            AgentState::Outgoing(call) | AgentState::Incoming(call) => Some(call),
            AgentState::InCall { call, .. } => Some(call),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, AgentState::Idle)
    }
}

/// What the agent reports to its user interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentNotice {
    IncomingCall(CallRecord),
    Answered(CallRecord),
    MediaConnected(CallId),
    RemoteMedia(CallId, TrackKind),
    /// The other side ended, rejected or never answered the call.
    CallFinished(CallRecord),
    Failed { call_id: CallId, error: CallError },
    ServerError { kind: String, message: String },
}

pub struct CallAgent {
    user: UserId,
    control: Arc<dyn CallControl>,
    sink: Arc<dyn SignalSink>,
    devices: Arc<dyn MediaDevices>,
    engines: Arc<dyn EngineFactory>,
    negotiation_timeout: Duration,
    state: AgentState,
    coordinator: Option<MediaCoordinator>,
    muted: bool,
    video_off: bool,
    deadline: Option<Instant>,
    engine_tx: mpsc::UnboundedSender<(CallId, EngineEvent)>,
    engine_rx: Option<mpsc::UnboundedReceiver<(CallId, EngineEvent)>>,
    notices: mpsc::UnboundedSender<AgentNotice>,
}

impl CallAgent {
    pub fn new(
        user: UserId,
        control: Arc<dyn CallControl>,
        sink: Arc<dyn SignalSink>,
        devices: Arc<dyn MediaDevices>,
        engines: Arc<dyn EngineFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<AgentNotice>) {
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let (notices, notice_rx) = mpsc::unbounded_channel();
        let agent = Self {
            user,
            control,
            sink,
            devices,
            engines,
            negotiation_timeout: Duration::from_secs(DEFAULT_NEGOTIATION_TIMEOUT_SECS),
            state: AgentState::Idle,
            coordinator: None,
            muted: false,
            video_off: false,
            deadline: None,
            engine_tx,
            engine_rx: Some(engine_rx),
            notices,
        };
        (agent, notice_rx)
    }

    pub fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    pub fn user(&self) -> UserId {
        self.user
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    fn current_call_id(&self) -> Option<CallId> {
        self.state.call().map(|call| call.id)
    }

    fn notify(&self, notice: AgentNotice) {
        let _ = self.notices.send(notice);
    }

    // ------------------------------------------------------------------
    // User commands
    // ------------------------------------------------------------------

    /// Start a call and capture local media for it. The offer goes out once
    /// the receiver answers.
    pub async fn place_call(&mut self, receiver: UserId, media_kind: MediaKind) -> Result<CallRecord> {
        if !self.state.is_idle() {
            return Err(ClientError::Busy);
        }

        let call = self.control.initiate(receiver, media_kind).await?;
        info!(call = %call.id, receiver = %receiver.short(), kind = media_kind.as_str(), "calling");

        let mut coordinator = self.new_coordinator(&call, NegotiationRole::Offerer);
        self.state = AgentState::Outgoing(call.clone());

        match coordinator.start(self.devices.as_ref(), call.media_kind).await {
            Ok(_) => {
                self.coordinator = Some(coordinator);
                self.apply_toggles();
                Ok(call)
            }
            Err(error) => {
                coordinator.close().await;
                self.state = AgentState::Idle;
                self.end_on_server(call.id).await;
                Err(error.into())
            }
        }
    }

    pub async fn answer(&mut self) -> Result<CallRecord> {
        let AgentState::Incoming(call) = &self.state else {
            return Err(ClientError::NoCall("answer"));
        };
        let call_id = call.id;

        let answered = match self.control.answer(call_id).await {
            Ok(call) => call,
            Err(e) => {
                // Someone else settled the call first.
                if matches!(
                    e.call_error(),
                    Some(CallError::InvalidState { .. } | CallError::CallNotFound)
                ) {
                    self.teardown().await;
                }
                return Err(e);
            }
        };
        info!(call = %call_id, "answered");

        self.state = AgentState::InCall {
            call: answered.clone(),
            media_connected: false,
        };
        self.arm_deadline();

        let started = match self.coordinator.as_mut() {
            Some(coordinator) => {
                coordinator
                    .start(self.devices.as_ref(), answered.media_kind)
                    .await
            }
            None => Ok(None),
        };
        if started.is_ok() {
            self.apply_toggles();
        }
        match started {
            Ok(Some(event)) => self.on_coordinator_event(call_id, event).await,
            Ok(None) => {}
            Err(error) => {
                self.fail(call_id, error.clone()).await;
                return Err(error.into());
            }
        }
        Ok(answered)
    }

    pub async fn reject(&mut self) -> Result<()> {
        let AgentState::Incoming(call) = &self.state else {
            return Err(ClientError::NoCall("reject"));
        };
        let call_id = call.id;

        // A reject that never reaches the server is settled by the ring timeout.
        let result = self.control.reject(call_id).await;
        self.teardown().await;
        info!(call = %call_id, "rejected");
        result
    }

    /// End the current call, releasing local media before telling the server.
    pub async fn hang_up(&mut self) -> Result<()> {
        let Some(call_id) = self.current_call_id() else {
            return Err(ClientError::NoCall("hang up"));
        };
        self.teardown().await;
        info!(call = %call_id, "hung up");
        self.control.end(call_id).await.map(|_| ())
    }

    /// Mute or unmute the microphone for the current call. The setting holds
    /// for the rest of the call, including media captured after it is set.
    pub fn set_muted(&mut self, muted: bool) -> Result<()> {
        let Some(call_id) = self.current_call_id() else {
            return Err(ClientError::NoCall("mute"));
        };
        self.muted = muted;
        self.apply_toggles();
        info!(call = %call_id, muted, "microphone toggled");
        Ok(())
    }

    /// Turn the camera off or back on for the current call.
    pub fn set_video_enabled(&mut self, enabled: bool) -> Result<()> {
        let Some(call) = self.state.call() else {
            return Err(ClientError::NoCall("toggle video"));
        };
        if !call.media_kind.wants_video() {
            debug!(call = %call.id, "audio call, camera toggle ignored");
            return Ok(());
        }
        let call_id = call.id;
        self.video_off = !enabled;
        self.apply_toggles();
        info!(call = %call_id, enabled, "camera toggled");
        Ok(())
    }

    fn apply_toggles(&self) {
        let Some(media) = self.coordinator.as_ref().and_then(MediaCoordinator::media) else {
            return;
        };
        media.set_enabled(TrackKind::Audio, !self.muted);
        media.set_enabled(TrackKind::Video, !self.video_off);
    }

    // ------------------------------------------------------------------
    // Inbound events
    // ------------------------------------------------------------------

    pub async fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::IncomingCall { call } => self.on_incoming(call).await,
            ServerEvent::CallAnswered { call } => self.on_answered(call).await,
            ServerEvent::CallRejected { call }
            | ServerEvent::CallMissed { call }
            | ServerEvent::CallEnded { call, .. } => {
                if self.current_call_id() != Some(call.id) {
                    debug!(call = %call.id, status = %call.status, "finish for another call");
                    return;
                }
                info!(call = %call.id, status = %call.status, "call finished remotely");
                self.teardown().await;
                self.notify(AgentNotice::CallFinished(call));
            }
            ServerEvent::Pong => {}
            ServerEvent::Error { kind, message } => {
                warn!(%kind, %message, "server refused a frame");
                self.notify(AgentNotice::ServerError { kind, message });
            }
            relayed => {
                let Some((call_id, from, signal)) = relayed.as_signal() else {
                    return;
                };
                let Some(coordinator) = self
                    .coordinator
                    .as_mut()
                    .filter(|c| c.call_id() == call_id)
                else {
                    debug!(call = %call_id, kind = signal.label(), "signal for no current call");
                    return;
                };
                if from != coordinator.session().remote_user {
                    warn!(call = %call_id, from = %from.short(), "signal from unexpected sender");
                    return;
                }
                if let Some(event) = coordinator.handle_signal(signal).await {
                    self.on_coordinator_event(call_id, event).await;
                }
            }
        }
    }

    pub async fn handle_engine_event(&mut self, (call_id, event): (CallId, EngineEvent)) {
        let Some(coordinator) = self
            .coordinator
            .as_mut()
            .filter(|c| c.call_id() == call_id)
        else {
            debug!(call = %call_id, ?event, "stale engine event");
            return;
        };
        if let Some(event) = coordinator.handle_engine_event(event).await {
            self.on_coordinator_event(call_id, event).await;
        }
    }

    /// Give up on a call whose media did not connect in time.
    pub async fn negotiation_timed_out(&mut self) {
        self.deadline = None;
        if let Some(call_id) = self.current_call_id() {
            let error = CallError::NegotiationFailed("timed out waiting for media".into());
            self.fail(call_id, error).await;
        }
    }

    async fn on_incoming(&mut self, call: CallRecord) {
        if call.receiver_id != self.user {
            debug!(call = %call.id, "incoming call for someone else");
            return;
        }
        if !self.state.is_idle() {
            info!(call = %call.id, caller = %call.caller_id.short(), "busy, declining");
            if let Err(e) = self.control.reject(call.id).await {
                warn!(call = %call.id, error = %e, "failed to decline while busy");
            }
            return;
        }

        // Built now so that an early offer is stashed rather than lost.
        self.coordinator = Some(self.new_coordinator(&call, NegotiationRole::Answerer));
        self.state = AgentState::Incoming(call.clone());
        info!(call = %call.id, caller = %call.caller_id.short(), "incoming call");
        self.notify(AgentNotice::IncomingCall(call));
    }

    async fn on_answered(&mut self, call: CallRecord) {
        if !matches!(&self.state, AgentState::Outgoing(current) if current.id == call.id) {
            debug!(call = %call.id, "answer for no outgoing call");
            return;
        }
        info!(call = %call.id, "call answered");
        self.state = AgentState::InCall {
            call: call.clone(),
            media_connected: false,
        };
        self.arm_deadline();
        self.notify(AgentNotice::Answered(call.clone()));

        let sent = match self.coordinator.as_mut() {
            Some(coordinator) => coordinator.send_offer().await,
            None => Ok(()),
        };
        if let Err(error) = sent {
            self.fail(call.id, error).await;
        }
    }

    async fn on_coordinator_event(&mut self, call_id: CallId, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::MediaConnected => {
                self.deadline = None;
                if let AgentState::InCall {
                    media_connected, ..
                } = &mut self.state
                {
                    *media_connected = true;
                }
                self.notify(AgentNotice::MediaConnected(call_id));
            }
            CoordinatorEvent::RemoteMedia(kind) => {
                self.notify(AgentNotice::RemoteMedia(call_id, kind));
            }
            CoordinatorEvent::Failed(error) => self.fail(call_id, error).await,
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Release media, close the negotiation and return to idle.
    async fn teardown(&mut self) {
        self.deadline = None;
        self.muted = false;
        self.video_off = false;
        if let Some(mut coordinator) = self.coordinator.take() {
            coordinator.close().await;
        }
        self.state = AgentState::Idle;
    }

    /// Tear down locally and end the call on the server so the record does
    /// not stay ringing or connected.
    async fn fail(&mut self, call_id: CallId, error: CallError) {
        warn!(call = %call_id, %error, "call failed");
        self.teardown().await;
        self.end_on_server(call_id).await;
        self.notify(AgentNotice::Failed { call_id, error });
    }

    async fn end_on_server(&self, call_id: CallId) {
        if let Err(e) = self.control.end(call_id).await {
            warn!(call = %call_id, error = %e, "failed to end call on server");
        }
    }

    fn arm_deadline(&mut self) {
        self.deadline = Some(Instant::now() + self.negotiation_timeout);
    }

    fn new_coordinator(&self, call: &CallRecord, role: NegotiationRole) -> MediaCoordinator {
        let remote = match role {
            NegotiationRole::Offerer => call.receiver_id,
            NegotiationRole::Answerer => call.caller_id,
        };
        let engine = self
            .engines
            .create(EngineEventSink::new(call.id, self.engine_tx.clone()));
        coordinator_for(call.id, self.user, remote, role, engine, self.sink.clone())
    }

    // ------------------------------------------------------------------
    // Task
    // ------------------------------------------------------------------

    /// Run the agent until the signaling channel or every handle goes away.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<ServerEvent>,
        mut commands: mpsc::Receiver<AgentCommand>,
    ) {
        let Some(mut engine_events) = self.engine_rx.take() else {
            warn!("engine events already taken, agent not started");
            return;
        };

        loop {
            let deadline = self.deadline;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = events.recv() => match event {
                    Some(event) => self.handle_server_event(event).await,
                    None => {
                        info!(user = %self.user.short(), "signaling channel closed");
                        break;
                    }
                },
                Some(event) = engine_events.recv() => self.handle_engine_event(event).await,
                _ = wait_until(deadline) => self.negotiation_timed_out().await,
            }
        }

        if let Some(call_id) = self.current_call_id() {
            self.teardown().await;
            self.end_on_server(call_id).await;
        }
    }

    pub fn spawn(self, events: mpsc::Receiver<ServerEvent>) -> (AgentHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(self.run(events, rx));
        (AgentHandle { commands: tx }, task)
    }

    async fn handle_command(&mut self, command: AgentCommand) {
        match command {
            AgentCommand::PlaceCall {
                receiver,
                media_kind,
                reply,
            } => {
                let _ = reply.send(self.place_call(receiver, media_kind).await);
            }
            AgentCommand::Answer { reply } => {
                let _ = reply.send(self.answer().await);
            }
            AgentCommand::Reject { reply } => {
                let _ = reply.send(self.reject().await);
            }
            AgentCommand::HangUp { reply } => {
                let _ = reply.send(self.hang_up().await);
            }
            AgentCommand::SetMuted { muted, reply } => {
                let _ = reply.send(self.set_muted(muted));
            }
            AgentCommand::SetVideoEnabled { enabled, reply } => {
                let _ = reply.send(self.set_video_enabled(enabled));
            }
            AgentCommand::State { reply } => {
                let _ = reply.send(self.state.clone());
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

pub enum AgentCommand {
    PlaceCall {
        receiver: UserId,
        media_kind: MediaKind,
        reply: oneshot::Sender<Result<CallRecord>>,
    },
    Answer {
        reply: oneshot::Sender<Result<CallRecord>>,
    },
    Reject {
        reply: oneshot::Sender<Result<()>>,
    },
    HangUp {
        reply: oneshot::Sender<Result<()>>,
    },
    SetMuted {
        muted: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    SetVideoEnabled {
        enabled: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    State {
        reply: oneshot::Sender<AgentState>,
    },
}

/// Cloneable front end of a running [`CallAgent`].
#[derive(Debug, Clone)]
pub struct AgentHandle {
    commands: mpsc::Sender<AgentCommand>,
}

impl AgentHandle {
    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> AgentCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| ClientError::AgentStopped)?;
        rx.await.map_err(|_| ClientError::AgentStopped)
    }

    pub async fn place_call(&self, receiver: UserId, media_kind: MediaKind) -> Result<CallRecord> {
        self.request(|reply| AgentCommand::PlaceCall {
            receiver,
            media_kind,
            reply,
        })
        .await?
    }

    pub async fn answer(&self) -> Result<CallRecord> {
        self.request(|reply| AgentCommand::Answer { reply }).await?
    }

    pub async fn reject(&self) -> Result<()> {
        self.request(|reply| AgentCommand::Reject { reply }).await?
    }

    pub async fn hang_up(&self) -> Result<()> {
        self.request(|reply| AgentCommand::HangUp { reply }).await?
    }

    pub async fn set_muted(&self, muted: bool) -> Result<()> {
        self.request(|reply| AgentCommand::SetMuted { muted, reply })
            .await?
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<()> {
        self.request(|reply| AgentCommand::SetVideoEnabled { enabled, reply })
            .await?
    }

    pub async fn state(&self) -> Result<AgentState> {
        self.request(|reply| AgentCommand::State { reply }).await
    }
}
