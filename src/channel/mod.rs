//! Control channel: one duplex transport, one reader task, one writer task.
//!
//! Outgoing envelopes are queued to the writer task so frames never
//! interleave. The reader task resolves pending requests by `in_reply_to`
//! and dispatches everything else to handlers keyed by action, in the order
//! envelopes arrive on the wire.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::network::{read_frame, write_frame, Frame};
use crate::protocol::{Action, Envelope, ErrorCode, ErrorPayload, MessageType, Role};
use crate::transport::ControlTransport;

/// What a handler wants sent back for a request or command.
#[derive(Debug, Clone)]
pub enum Reply {
    Ok(Map<String, Value>),
    Err(ErrorPayload),
}

/// Handlers run on the reader task and must not block.
///
/// Returning `None` for a request means no reply is sent.
pub type Handler = Arc<dyn Fn(&Envelope) -> Option<Reply> + Send + Sync>;

/// Action-keyed handler registry. Clones share the same table, so handlers
/// survive across the channels a session opens on reconnect.
#[derive(Clone, Default)]
pub struct Handlers {
    table: Arc<RwLock<HashMap<Action, Handler>>>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `action`, replacing any previous one.
    pub fn on<F>(&self, action: impl Into<Action>, handler: F)
    where
        F: Fn(&Envelope) -> Option<Reply> + Send + Sync + 'static,
    {
        let action = action.into();
        if let Ok(mut table) = self.table.write() {
            table.insert(action, Arc::new(handler));
        }
    }

    fn get(&self, action: &Action) -> Option<Handler> {
        self.table.read().ok()?.get(action).cloned()
    }
}

/// Out-of-band happenings on a channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The transport hit EOF or an I/O error; the channel is dead.
    Disconnected { reason: String },
    /// A frame could not be decoded and was skipped.
    DecodeFailed { reason: String },
    /// A notification or reply nobody was waiting for.
    Unhandled(Envelope),
}

enum Outgoing {
    Frame(Vec<u8>),
    Close,
}

type Pending = Arc<Mutex<HashMap<Uuid, oneshot::Sender<Envelope>>>>;

/// Cheap handle for queueing envelopes from handlers or other tasks.
#[derive(Clone)]
pub struct ChannelSender {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    max_message_size: usize,
}

impl ChannelSender {
    pub fn send(&self, envelope: &Envelope) -> Result<()> {
        let body = envelope.to_bytes()?;
        if body.len() > self.max_message_size {
            return Err(Error::MessageTooLarge {
                size: body.len(),
                max: self.max_message_size,
            });
        }
        self.outgoing
            .send(Outgoing::Frame(body))
            .map_err(|_| Error::TransportClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.outgoing.is_closed()
    }
}

pub struct ControlChannel {
    sender: ChannelSender,
    pending: Pending,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl ControlChannel {
    /// Take ownership of `transport` and start the reader and writer tasks.
    pub fn open<T: ControlTransport>(
        transport: T,
        role: Role,
        config: &Config,
        handlers: Handlers,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (read_half, write_half) = tokio::io::split(transport);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        let sender = ChannelSender {
            outgoing: out_tx,
            max_message_size: config.max_message_size,
        };

        let writer = tokio::spawn(write_loop(write_half, out_rx, event_tx.clone()));
        let reader = tokio::spawn(read_loop(ReadLoop {
            reader: read_half,
            max_message_size: config.max_message_size,
            role,
            handlers,
            pending: pending.clone(),
            sender: sender.clone(),
            events: event_tx,
        }));

        let channel = Self {
            sender,
            pending,
            reader,
            writer,
        };
        (channel, event_rx)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed() || self.reader.is_finished()
    }

    /// Fire-and-forget.
    pub fn notify(&self, envelope: &Envelope) -> Result<()> {
        self.sender.send(envelope)
    }

    /// Send `envelope` and wait up to `timeout` for its correlated reply.
    ///
    /// A timeout only fails this request; the channel stays usable.
    pub async fn request(&self, envelope: Envelope, timeout: Duration) -> Result<Envelope> {
        let id = envelope.message_id;
        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(id, tx);

        if let Err(e) = self.sender.send(&envelope) {
            self.lock_pending().remove(&id);
            return Err(e);
        }
        trace!(%id, action = %envelope.action, "request sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) if reply.kind == MessageType::Error => Err(remote_error(&reply)),
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::TransportClosed),
            Err(_) => {
                self.lock_pending().remove(&id);
                debug!(%id, action = %envelope.action, "request timed out");
                Err(Error::timeout(format!("reply to {}", envelope.action), timeout))
            }
        }
    }

    /// Flush queued frames, shut the transport down and stop reading.
    pub fn close(&self) {
        let _ = self.sender.outgoing.send(Outgoing::Close);
        self.reader.abort();
    }

    /// Wait until the writer has flushed and shut the transport down.
    pub async fn closed(&mut self) {
        let _ = (&mut self.writer).await;
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, oneshot::Sender<Envelope>>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn remote_error(reply: &Envelope) -> Error {
    match reply.payload::<ErrorPayload>() {
        Ok(payload) => Error::Remote {
            code: payload.error_code.to_string(),
            message: payload.error_message,
        },
        Err(_) => Error::Remote {
            code: "unknown".into(),
            message: Value::Object(reply.data.clone()).to_string(),
        },
    }
}

async fn write_loop<T: ControlTransport>(
    mut writer: WriteHalf<T>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    while let Some(item) = outgoing.recv().await {
        match item {
            Outgoing::Frame(body) => {
                if let Err(e) = write_frame(&mut writer, &body).await {
                    warn!("control write failed: {}", e);
                    let _ = events.send(ChannelEvent::Disconnected {
                        reason: e.to_string(),
                    });
                    return;
                }
            }
            Outgoing::Close => break,
        }
    }
    let _ = writer.shutdown().await;
}

struct ReadLoop<T> {
    reader: ReadHalf<T>,
    max_message_size: usize,
    role: Role,
    handlers: Handlers,
    pending: Pending,
    sender: ChannelSender,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

async fn read_loop<T: ControlTransport>(mut ctx: ReadLoop<T>) {
    loop {
        let frame = match read_frame(&mut ctx.reader, ctx.max_message_size).await {
            Ok(frame) => frame,
            Err(e) => {
                debug!("control link closed: {}", e);
                // Dropping the senders fails every waiter with TransportClosed.
                if let Ok(mut pending) = ctx.pending.lock() {
                    pending.clear();
                }
                let _ = ctx.events.send(ChannelEvent::Disconnected {
                    reason: e.to_string(),
                });
                return;
            }
        };

        let body = match frame {
            Frame::Data(body) => body,
            Frame::Oversized(size) => {
                warn!(
                    "dropped {} byte control frame (limit {})",
                    size, ctx.max_message_size
                );
                continue;
            }
        };

        match Envelope::from_bytes(&body) {
            Ok(envelope) => ctx.dispatch(envelope),
            Err(e) => {
                warn!("undecodable control frame: {}", e);
                let _ = ctx.events.send(ChannelEvent::DecodeFailed {
                    reason: e.to_string(),
                });
            }
        }
    }
}

impl<T> ReadLoop<T> {
    fn dispatch(&self, envelope: Envelope) {
        if envelope.kind.is_reply() {
            let waiter = envelope.in_reply_to.and_then(|id| {
                self.pending
                    .lock()
                    .ok()
                    .and_then(|mut pending| pending.remove(&id))
            });
            match waiter {
                Some(tx) => {
                    let _ = tx.send(envelope);
                }
                None => {
                    debug!(action = %envelope.action, "reply without a waiting request");
                    let _ = self.events.send(ChannelEvent::Unhandled(envelope));
                }
            }
            return;
        }

        let Some(handler) = self.handlers.get(&envelope.action) else {
            if envelope.kind.expects_reply() {
                let payload = ErrorPayload::new(
                    ErrorCode::E008,
                    format!("unsupported action {}", envelope.action),
                );
                self.respond(envelope.error_reply(&payload, self.role));
            } else {
                debug!(action = %envelope.action, "unhandled notification");
                let _ = self.events.send(ChannelEvent::Unhandled(envelope));
            }
            return;
        };

        let reply = handler(&envelope);
        if !envelope.kind.expects_reply() {
            return;
        }
        match reply {
            Some(Reply::Ok(data)) => self.respond(envelope.reply_to(data, self.role)),
            Some(Reply::Err(payload)) => self.respond(envelope.error_reply(&payload, self.role)),
            None => {}
        }
    }

    fn respond(&self, reply: Envelope) {
        if let Err(e) = self.sender.send(&reply) {
            warn!(action = %reply.action, "could not send reply: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{to_data, Color, ColorChange, ColorChangeAck};
    use tokio::io::DuplexStream;

    fn config() -> Config {
        Config {
            control_message_timeout: Duration::from_millis(200),
            ..Config::default()
        }
    }

    fn pair(
        mobile: Handlers,
        desktop: Handlers,
    ) -> (
        (ControlChannel, mpsc::UnboundedReceiver<ChannelEvent>),
        (ControlChannel, mpsc::UnboundedReceiver<ChannelEvent>),
    ) {
        let (a, b) = tokio::io::duplex(4096);
        (
            ControlChannel::open(a, Role::Mobile, &config(), mobile),
            ControlChannel::open(b, Role::Desktop, &config(), desktop),
        )
    }

    fn color_command(color: Color) -> Envelope {
        Envelope::command(
            Action::ColorChange,
            to_data(&ColorChange { color }).unwrap(),
            Role::Mobile,
        )
    }

    fn ack_colors(handlers: &Handlers) {
        handlers.on(Action::ColorChange, |env| {
            let change: ColorChange = env.payload().ok()?;
            let ack = ColorChangeAck {
                success: true,
                current_color: change.color,
            };
            Some(Reply::Ok(to_data(&ack).ok()?))
        });
    }

    #[tokio::test]
    async fn test_request_gets_correlated_reply() {
        let desktop = Handlers::new();
        ack_colors(&desktop);
        let ((mobile, _), (_desktop, _)) = pair(Handlers::new(), desktop);

        let request = color_command(Color::Green);
        let id = request.message_id;
        let reply = mobile.request(request, Duration::from_secs(1)).await.unwrap();

        assert_eq!(reply.in_reply_to, Some(id));
        assert_eq!(reply.action, Action::ColorChangeAck);
        assert_eq!(reply.source, Role::Desktop);
        let ack: ColorChangeAck = reply.payload().unwrap();
        assert_eq!(ack.current_color, Color::Green);
    }

    #[tokio::test]
    async fn test_timeout_keeps_channel_usable() {
        let desktop = Handlers::new();
        // Swallows the first command, answers the rest.
        let seen = Arc::new(Mutex::new(0u32));
        let counter = seen.clone();
        desktop.on(Action::ColorChange, move |_| {
            let mut n = counter.lock().unwrap();
            *n += 1;
            (*n > 1).then(|| Reply::Ok(Map::new()))
        });
        let ((mobile, _), (_desktop, _)) = pair(Handlers::new(), desktop);

        let err = mobile
            .request(color_command(Color::Red), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(!mobile.is_closed());

        let reply = mobile.request(color_command(Color::Red), config().control_message_timeout).await.unwrap();
        assert_eq!(reply.kind, MessageType::Response);
    }

    #[tokio::test]
    async fn test_unhandled_request_gets_error_reply() {
        let ((mobile, _), (_desktop, _)) = pair(Handlers::new(), Handlers::new());
        let request = Envelope::request("reboot", Map::new(), Role::Mobile);
        let err = mobile.request(request, config().control_message_timeout).await.unwrap_err();
        match err {
            Error::Remote { code, .. } => assert_eq!(code, "E008"),
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_oversized_envelope_is_rejected() {
        let ((mobile, _), (_desktop, _)) = pair(Handlers::new(), Handlers::new());
        let mut data = Map::new();
        data.insert("blob".into(), Value::String("x".repeat(1024)));
        let err = mobile
            .notify(&Envelope::notification("blob", data, Role::Mobile))
            .unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_notifications_arrive_in_order() {
        let mobile_handlers = Handlers::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        mobile_handlers.on("tick", move |env| {
            let _ = tx.send(env.field::<u32>("n").ok()?);
            None
        });
        let ((_mobile, _), (desktop, _)) = pair(mobile_handlers, Handlers::new());

        for n in 0..20u32 {
            let mut data = Map::new();
            data.insert("n".into(), n.into());
            desktop
                .notify(&Envelope::notification("tick", data, Role::Desktop))
                .unwrap();
        }
        for expected in 0..20u32 {
            assert_eq!(rx.recv().await, Some(expected));
        }
    }

    #[tokio::test]
    async fn test_unknown_notification_is_surfaced() {
        let ((_mobile, mut mobile_events), (desktop, _)) = pair(Handlers::new(), Handlers::new());
        desktop
            .notify(&Envelope::notification("battery_level", Map::new(), Role::Desktop))
            .unwrap();
        match mobile_events.recv().await {
            Some(ChannelEvent::Unhandled(env)) => {
                assert_eq!(env.action, Action::Other("battery_level".into()))
            }
            other => panic!("expected unhandled notification, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_peer_drop_fails_pending_and_reports() {
        let desktop = Handlers::new();
        desktop.on(Action::ColorChange, |_| None);
        let ((mobile, mut events), (mut desktop, _)) = pair(Handlers::new(), desktop);

        let pending = tokio::spawn(async move {
            let result = mobile
                .request(color_command(Color::Yellow), Duration::from_secs(5))
                .await;
            (mobile, result)
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        desktop.close();
        desktop.closed().await;

        let (_mobile, result) = pending.await.unwrap();
        assert!(matches!(result, Err(Error::TransportClosed)));
        assert!(matches!(
            events.recv().await,
            Some(ChannelEvent::Disconnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_garbage_frame_is_skipped() {
        let (a, mut raw): (DuplexStream, DuplexStream) = tokio::io::duplex(4096);
        let handlers = Handlers::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        handlers.on("ping", move |_| {
            let _ = tx.send(());
            None
        });
        let (_channel, mut events) = ControlChannel::open(a, Role::Desktop, &config(), handlers);

        write_frame(&mut raw, b"{not json").await.unwrap();
        let ping = Envelope::notification("ping", Map::new(), Role::Mobile);
        write_frame(&mut raw, &ping.to_bytes().unwrap()).await.unwrap();

        assert!(matches!(
            events.recv().await,
            Some(ChannelEvent::DecodeFailed { .. })
        ));
        assert_eq!(rx.recv().await, Some(()));
    }
}
