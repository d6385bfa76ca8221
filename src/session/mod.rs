//! Session supervisor.
//!
//! A [`Session`] owns the control link for its whole life: it connects via a
//! [`Connector`], exchanges the `handshake`, reconnects with backoff when
//! configured to, and tracks the bulk network substrate. Everything it knows
//! is published as a [`SessionSnapshot`] over a `watch` channel and as
//! [`SessionEvent`]s over a `broadcast` bus.

pub mod state;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::channel::{ChannelEvent, ControlChannel, Handlers, Reply};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::protocol::{
    to_data, Action, ConnectionStatus, Envelope, ErrorCode, ErrorPayload, Handshake, HotspotInfo,
    MessageType, Role, PROTOCOL_VERSION,
};
use crate::transport::{BulkNetwork, Connector};

pub use state::{LinkState, NetworkState, StateMachine, TransferState};

const EVENT_CAPACITY: usize = 64;

/// Point-in-time copy of the session state.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub role: Role,
    pub link: LinkState,
    pub network: NetworkState,
    pub peer_role: Option<Role>,
    /// Last `wifi_hotspot_info` the peer announced.
    pub peer_hotspot: Option<HotspotInfo>,
    pub last_activity: DateTime<Utc>,
    /// Consecutive reconnect attempts since the link was last up.
    pub reconnect_attempts: u32,
}

impl SessionSnapshot {
    fn new(role: Role) -> Self {
        Self {
            role,
            link: LinkState::Disconnected,
            network: NetworkState::Disabled,
            peer_role: None,
            peer_hotspot: None,
            last_activity: Utc::now(),
            reconnect_attempts: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Link { from: LinkState, to: LinkState },
    Network { from: NetworkState, to: NetworkState },
    PeerHotspot(HotspotInfo),
    PeerNetworkStatus(ConnectionStatus),
    /// A notification no handler was registered for.
    Notification(Envelope),
    DecodeFailed { reason: String },
}

enum Command {
    Reconnect,
    Close,
}

struct Shared {
    role: Role,
    config: Config,
    handlers: Handlers,
    channel: RwLock<Option<Arc<ControlChannel>>>,
    state: watch::Sender<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
}

impl Shared {
    fn set_link(&self, to: LinkState) {
        let mut from = None;
        self.state.send_modify(|s| {
            if s.link != to && s.link.can_transition_to(to) {
                from = Some(s.link);
                s.link = to;
                s.last_activity = Utc::now();
            }
        });
        match from {
            Some(from) => {
                info!(role = %self.role, "control link {} -> {}", from, to);
                self.publish(SessionEvent::Link { from, to });
            }
            None if self.state.borrow().link != to => {
                warn!(role = %self.role, "ignored link transition to {}", to);
            }
            None => {}
        }
    }

    fn set_network(&self, to: NetworkState) {
        let mut from = None;
        self.state.send_modify(|s| {
            if s.network != to && s.network.can_transition_to(to) {
                from = Some(s.network);
                s.network = to;
                s.last_activity = Utc::now();
            }
        });
        if let Some(from) = from {
            info!(role = %self.role, "bulk network {} -> {}", from, to);
            self.publish(SessionEvent::Network { from, to });
        }
    }

    fn touch(&self) {
        self.state.send_modify(|s| s.last_activity = Utc::now());
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn channel(&self) -> Option<Arc<ControlChannel>> {
        self.channel.read().ok()?.clone()
    }

    fn install_channel(&self, channel: Option<Arc<ControlChannel>>) -> Option<Arc<ControlChannel>> {
        match self.channel.write() {
            Ok(mut slot) => std::mem::replace(&mut *slot, channel),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), channel),
        }
    }
}

/// One end of a coordinated mobile/desktop session.
pub struct Session {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    network_op: Mutex<()>,
    supervisor: JoinHandle<()>,
}

impl Session {
    /// Validate `config` and start connecting in the background.
    ///
    /// Returns immediately; use [`Session::wait_for_link`] or
    /// [`Session::subscribe`] to learn when the link is up.
    pub fn open<C: Connector>(connector: C, role: Role, config: Config) -> Result<Self> {
        config.validate()?;
        let (state, _) = watch::channel(SessionSnapshot::new(role));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            role,
            config,
            handlers: Handlers::new(),
            channel: RwLock::new(None),
            state,
            events,
        });
        install_builtin_handlers(&shared);

        let (commands, command_rx) = mpsc::unbounded_channel();
        let supervisor = tokio::spawn(supervise(shared.clone(), connector, command_rx));

        Ok(Self {
            shared,
            commands,
            network_op: Mutex::new(()),
            supervisor,
        })
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn current_state(&self) -> SessionSnapshot {
        self.shared.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionSnapshot> {
        self.shared.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Wait until the control link reaches `target`.
    pub async fn wait_for_link(&self, target: LinkState, timeout: Duration) -> Result<SessionSnapshot> {
        let mut rx = self.watch_state();
        let reached = tokio::time::timeout(timeout, async {
            rx.wait_for(|s| s.link == target).await.map(|snapshot| snapshot.clone())
        })
        .await;
        match reached {
            Ok(Ok(snapshot)) => Ok(snapshot),
            Ok(Err(_)) => Err(Error::TransportClosed),
            Err(_) => Err(Error::timeout(format!("control link to become {target}"), timeout)),
        }
    }

    /// Send a `command` and wait for its acknowledgement.
    pub async fn send_command(&self, action: impl Into<Action>, data: Map<String, Value>) -> Result<Envelope> {
        let envelope = Envelope::command(action, data, self.shared.role);
        self.request(envelope, self.shared.config.control_message_timeout)
            .await
    }

    /// Send any envelope expecting a reply and wait up to `timeout` for it.
    pub async fn request(&self, envelope: Envelope, timeout: Duration) -> Result<Envelope> {
        let channel = self.channel()?;
        self.shared.touch();
        let reply = channel.request(envelope, timeout).await?;
        self.shared.touch();
        Ok(reply)
    }

    pub fn notify(&self, action: impl Into<Action>, data: Map<String, Value>) -> Result<()> {
        self.send(&Envelope::notification(action, data, self.shared.role))
    }

    /// Queue an already built envelope without waiting for anything.
    pub fn send(&self, envelope: &Envelope) -> Result<()> {
        self.channel()?.notify(envelope)?;
        self.shared.touch();
        Ok(())
    }

    /// Run `handler` for every incoming `action` notification.
    ///
    /// Replaces a built-in handler of the same action.
    pub fn on_notification<F>(&self, action: impl Into<Action>, handler: F)
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.shared.handlers.on(action, move |envelope| {
            handler(envelope);
            None
        });
    }

    /// Answer incoming `action` commands and requests.
    pub fn on_request<F>(&self, action: impl Into<Action>, handler: F)
    where
        F: Fn(&Envelope) -> Option<Reply> + Send + Sync + 'static,
    {
        self.shared.handlers.on(action, handler);
    }

    /// Leave a settled `error` or `disconnected` state and connect again.
    pub fn reconnect(&self) -> Result<()> {
        self.commands
            .send(Command::Reconnect)
            .map_err(|_| Error::TransportClosed)
    }

    /// Close the control link and stop the supervisor.
    pub async fn close(&self) {
        if self.commands.send(Command::Close).is_err() {
            return;
        }
        let timeout = self.shared.config.control_message_timeout;
        if let Err(e) = self.wait_for_link(LinkState::Disconnected, timeout).await {
            debug!("close did not settle: {}", e);
        }
    }

    /// Start an access point for the bulk link and announce it to the peer.
    pub async fn start_hotspot<N: BulkNetwork>(&self, network: &mut N) -> Result<HotspotInfo> {
        let _op = self.network_op.lock().await;
        self.current_state()
            .network
            .transition(NetworkState::CreatingHotspot)?;

        let mut backoff = Backoff::new(self.shared.config.reconnect.clone());
        loop {
            self.shared.set_network(NetworkState::CreatingHotspot);
            match network.create_hotspot().await {
                Ok(info) => {
                    self.shared.set_network(NetworkState::HotspotActive);
                    info!(ssid = %info.ssid, port = info.port, "hotspot active");
                    self.announce(Envelope::wifi_hotspot_info(&info, self.shared.role));
                    return Ok(info);
                }
                Err(e) => {
                    warn!("hotspot creation failed: {}", e);
                    self.shared.set_network(NetworkState::Error);
                    match self.network_retry(&mut backoff) {
                        Some(delay) => tokio::time::sleep(delay).await,
                        None => return Err(Error::Io(e)),
                    }
                }
            }
        }
    }

    /// Join the access point the peer announced and report back.
    pub async fn join_network<N: BulkNetwork>(&self, network: &mut N, info: &HotspotInfo) -> Result<()> {
        let _op = self.network_op.lock().await;
        self.current_state()
            .network
            .transition(NetworkState::Connecting)?;

        let mut backoff = Backoff::new(self.shared.config.reconnect.clone());
        loop {
            self.shared.set_network(NetworkState::Connecting);
            match network.join(info).await {
                Ok(()) => {
                    self.shared.set_network(NetworkState::Connected);
                    info!(ssid = %info.ssid, "joined bulk network");
                    let status = ConnectionStatus {
                        connected: true,
                        ssid: Some(info.ssid.clone()),
                        message: None,
                    };
                    self.announce(Envelope::wifi_connection_status(&status, self.shared.role));
                    return Ok(());
                }
                Err(e) => {
                    warn!(ssid = %info.ssid, "joining bulk network failed: {}", e);
                    self.shared.set_network(NetworkState::Error);
                    match self.network_retry(&mut backoff) {
                        Some(delay) => tokio::time::sleep(delay).await,
                        None => return Err(Error::Io(e)),
                    }
                }
            }
        }
    }

    /// Tear down the hotspot or leave the joined network.
    pub async fn stop_network<N: BulkNetwork>(&self, network: &mut N) -> Result<()> {
        let _op = self.network_op.lock().await;
        if let Err(e) = network.stop().await {
            self.shared.set_network(NetworkState::Error);
            return Err(Error::Io(e));
        }
        self.shared.set_network(NetworkState::Disabled);
        Ok(())
    }

    /// Live channel, only while the link is `connected`.
    fn channel(&self) -> Result<Arc<ControlChannel>> {
        if self.shared.state.borrow().link != LinkState::Connected {
            return Err(Error::TransportClosed);
        }
        match self.shared.channel() {
            Some(channel) if !channel.is_closed() => Ok(channel),
            _ => Err(Error::TransportClosed),
        }
    }

    fn network_retry(&self, backoff: &mut Backoff) -> Option<Duration> {
        if !self.shared.config.auto_reconnect {
            return None;
        }
        backoff.next_retry()
    }

    /// Best effort: the peer also learns the state on its next request.
    fn announce(&self, envelope: Result<Envelope>) {
        match envelope.and_then(|envelope| self.send(&envelope)) {
            Ok(()) => {}
            Err(Error::TransportClosed) => debug!("control link down, announcement skipped"),
            Err(e) => warn!("announcement not sent: {}", e),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.supervisor.abort();
        if let Some(channel) = self.shared.install_channel(None) {
            channel.close();
        }
    }
}

fn install_builtin_handlers(shared: &Arc<Shared>) {
    let role = shared.role;
    let weak = Arc::downgrade(shared);
    shared.handlers.on(Action::Handshake, move |envelope| {
        let hello: Handshake = match envelope.payload() {
            Ok(hello) => hello,
            Err(e) => return Some(Reply::Err(ErrorPayload::new(ErrorCode::E007, e.to_string()))),
        };
        if hello.protocol_version != PROTOCOL_VERSION {
            let payload = ErrorPayload::new(
                ErrorCode::E001,
                format!("unsupported protocol version {}", hello.protocol_version),
            )
            .with_suggestion(format!("upgrade the peer to protocol {PROTOCOL_VERSION}"));
            return Some(Reply::Err(payload));
        }
        if let Some(shared) = weak.upgrade() {
            shared.state.send_modify(|s| s.peer_role = Some(hello.role));
        }
        let ours = Handshake {
            protocol_version: PROTOCOL_VERSION.to_string(),
            role,
        };
        to_data(&ours).ok().map(Reply::Ok)
    });

    let weak = Arc::downgrade(shared);
    shared.handlers.on(Action::WifiHotspotInfo, move |envelope| {
        match envelope.payload::<HotspotInfo>() {
            Ok(info) => {
                if let Some(shared) = weak.upgrade() {
                    debug!(ssid = %info.ssid, "peer hotspot announced");
                    shared.state.send_modify(|s| {
                        s.peer_hotspot = Some(info.clone());
                        s.last_activity = Utc::now();
                    });
                    shared.publish(SessionEvent::PeerHotspot(info));
                }
            }
            Err(e) => warn!("ignoring wifi_hotspot_info: {}", e),
        }
        None
    });

    let weak = Arc::downgrade(shared);
    shared.handlers.on(Action::WifiConnectionStatus, move |envelope| {
        match envelope.payload::<ConnectionStatus>() {
            Ok(status) => {
                if let Some(shared) = weak.upgrade() {
                    shared.touch();
                    shared.publish(SessionEvent::PeerNetworkStatus(status));
                }
            }
            Err(e) => warn!("ignoring wifi_connection_status: {}", e),
        }
        None
    });
}

enum Outcome {
    Closed,
    Lost(Error),
}

type Commands = mpsc::UnboundedReceiver<Command>;

async fn supervise<C: Connector>(shared: Arc<Shared>, mut connector: C, mut commands: Commands) {
    let mut backoff = Backoff::new(shared.config.reconnect.clone());
    loop {
        shared.set_link(LinkState::Connecting);
        match run_link(&shared, &mut connector, &mut commands, &mut backoff).await {
            Outcome::Closed => {
                shared.set_link(LinkState::Disconnected);
                return;
            }
            Outcome::Lost(err) => {
                warn!(role = %shared.role, "control link lost: {}", err);
                shared.set_link(LinkState::Error);
                if !shared.config.auto_reconnect {
                    shared.set_link(LinkState::Disconnected);
                } else if let Some(delay) = backoff.next_retry() {
                    let attempt = backoff.attempts();
                    shared.state.send_modify(|s| s.reconnect_attempts = attempt);
                    info!(attempt, "reconnecting in {:?}", delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = wait_for_close(&mut commands) => {
                            shared.set_link(LinkState::Disconnected);
                            return;
                        }
                    }
                } else {
                    warn!("giving up after {} reconnect attempts", backoff.attempts());
                }
            }
        }

        // Settled; only the caller can move us on.
        match commands.recv().await {
            Some(Command::Reconnect) => {
                backoff.reset();
                shared.state.send_modify(|s| s.reconnect_attempts = 0);
            }
            Some(Command::Close) | None => {
                shared.set_link(LinkState::Disconnected);
                return;
            }
        }
    }
}

async fn run_link<C: Connector>(
    shared: &Shared,
    connector: &mut C,
    commands: &mut Commands,
    backoff: &mut Backoff,
) -> Outcome {
    let transport = tokio::select! {
        connected = connector.connect() => match connected {
            Ok(transport) => transport,
            Err(e) => return Outcome::Lost(Error::from_io(e)),
        },
        _ = wait_for_close(commands) => return Outcome::Closed,
    };

    let (channel, mut events) =
        ControlChannel::open(transport, shared.role, &shared.config, shared.handlers.clone());
    let channel = Arc::new(channel);
    shared.install_channel(Some(channel.clone()));

    let outcome = tokio::select! {
        hello = handshake(shared, &channel) => match hello {
            Ok(peer) => {
                info!(role = %shared.role, %peer, "handshake complete");
                backoff.reset();
                shared.state.send_modify(|s| s.reconnect_attempts = 0);
                shared.set_link(LinkState::Connected);
                watch_link(shared, &mut events, commands).await
            }
            Err(e) => Outcome::Lost(e),
        },
        _ = wait_for_close(commands) => Outcome::Closed,
    };

    shared.install_channel(None);
    channel.close();
    outcome
}

async fn handshake(shared: &Shared, channel: &ControlChannel) -> Result<Role> {
    let ours = Handshake {
        protocol_version: PROTOCOL_VERSION.to_string(),
        role: shared.role,
    };
    let hello = Envelope::with_payload(MessageType::Request, Action::Handshake, &ours, shared.role)?;
    let reply = channel
        .request(hello, shared.config.control_message_timeout)
        .await?;
    let theirs: Handshake = reply.payload()?;
    if theirs.protocol_version != PROTOCOL_VERSION {
        return Err(Error::Protocol(format!(
            "peer speaks protocol {}, expected {}",
            theirs.protocol_version, PROTOCOL_VERSION
        )));
    }
    shared.state.send_modify(|s| s.peer_role = Some(theirs.role));
    Ok(theirs.role)
}

async fn watch_link(
    shared: &Shared,
    events: &mut mpsc::UnboundedReceiver<ChannelEvent>,
    commands: &mut Commands,
) -> Outcome {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ChannelEvent::Disconnected { reason }) => {
                    debug!("channel reported disconnect: {}", reason);
                    return Outcome::Lost(Error::TransportClosed);
                }
                None => return Outcome::Lost(Error::TransportClosed),
                Some(ChannelEvent::DecodeFailed { reason }) => {
                    shared.publish(SessionEvent::DecodeFailed { reason });
                }
                Some(ChannelEvent::Unhandled(envelope)) => {
                    shared.touch();
                    if envelope.kind == MessageType::Notification {
                        shared.publish(SessionEvent::Notification(envelope));
                    }
                }
            },
            _ = wait_for_close(commands) => return Outcome::Closed,
        }
    }
}

/// Resolves on `close()` or when the session handle is gone.
async fn wait_for_close(commands: &mut Commands) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Close => return,
            Command::Reconnect => debug!("reconnect requested while the link is live, ignored"),
        }
    }
}
