//! File transfer engine.
//!
//! A transfer is negotiated on the control channel (`file_transfer_request`
//! / `file_transfer_response`), admitted against the concurrency cap, and
//! then run over a bulk transport: handshake, one acknowledged chunk at a
//! time, and a final whole-file verdict.

pub mod chunker;
pub mod progress;
mod receiver;
mod sender;
pub mod wire;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::Reply;
use crate::checksum::ChecksumAlgorithm;
use crate::config::Config;
use crate::error::{Error, ErrorKind, Result};
use crate::protocol::{
    Action, Envelope, ErrorCode, ErrorPayload, FileTransferRequest, FileTransferResponse, Role,
};
use crate::session::{Session, StateMachine, TransferState};
use crate::transport::BulkTransport;

pub use chunker::{chunk_count, chunk_plan, ChunkRecord, ChunkSpan};
pub use progress::{Progress, ProgressTracker};

use wire::BulkLink;

/// Rejection reason when two peers offer transfers at the same time.
pub const CONFLICT: &str = "conflict";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Outbound,
    Inbound,
}

/// Negotiated parameters and lifecycle of one transfer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferDescriptor {
    pub transfer_id: Uuid,
    pub direction: TransferDirection,
    pub file_name: String,
    pub total_size: u64,
    pub checksum_algorithm: ChecksumAlgorithm,
    pub chunk_size: u32,
    state: TransferState,
}

impl TransferDescriptor {
    pub fn outbound(file_name: impl Into<String>, total_size: u64, chunk_size: u32) -> Self {
        Self::new(TransferDirection::Outbound, Uuid::new_v4(), file_name.into(), total_size, chunk_size)
    }

    pub fn inbound(transfer_id: Uuid, file_name: impl Into<String>, total_size: u64, chunk_size: u32) -> Self {
        Self::new(TransferDirection::Inbound, transfer_id, file_name.into(), total_size, chunk_size)
    }

    fn new(
        direction: TransferDirection,
        transfer_id: Uuid,
        file_name: String,
        total_size: u64,
        chunk_size: u32,
    ) -> Self {
        Self {
            transfer_id,
            direction,
            file_name,
            total_size,
            checksum_algorithm: ChecksumAlgorithm::Sha256,
            chunk_size,
            state: TransferState::Idle,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Move to `next` or fail with [`Error::InvalidTransition`].
    pub fn advance(&mut self, next: TransferState) -> Result<()> {
        self.state = self.state.transition(next)?;
        debug!(transfer_id = %self.transfer_id, "transfer {}", self.state);
        Ok(())
    }

    fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.state = TransferState::Failed;
            debug!(transfer_id = %self.transfer_id, "transfer failed");
        }
    }

    pub fn chunk_count(&self) -> u64 {
        chunk_count(self.total_size, self.chunk_size)
    }

    fn offer(&self, from: Role) -> FileTransferRequest {
        FileTransferRequest {
            transfer_id: self.transfer_id,
            file_name: self.file_name.clone(),
            file_size: self.total_size,
            transfer_direction: format!("{}_to_{}", from, from.peer()),
            checksum_type: self.checksum_algorithm,
            chunk_size: self.chunk_size,
            compression: false,
        }
    }
}

impl From<&FileTransferRequest> for TransferDescriptor {
    fn from(offer: &FileTransferRequest) -> Self {
        Self::inbound(offer.transfer_id, offer.file_name.clone(), offer.file_size, offer.chunk_size)
    }
}

/// Outcome of [`TransferEngine::request_transfer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Negotiation {
    Accepted { bulk_port: u16 },
    Rejected { reason: String },
}

/// What an offer policy decides for an incoming transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferDecision {
    Accept { bulk_port: u16 },
    Reject { reason: String },
}

/// Cooperative cancellation flag, checked between chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A reserved transfer slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct TransferPermit {
    descriptor: TransferDescriptor,
    cancel: CancelHandle,
    _slot: OwnedSemaphorePermit,
}

impl TransferPermit {
    pub fn descriptor(&self) -> &TransferDescriptor {
        &self.descriptor
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}

/// Where the file bytes come from or go to.
pub enum TransferIo {
    Source(Box<dyn AsyncRead + Send + Unpin>),
    Sink(Box<dyn AsyncWrite + Send + Unpin>),
}

impl TransferIo {
    pub fn source(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        TransferIo::Source(Box::new(reader))
    }

    pub fn sink(writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        TransferIo::Sink(Box::new(writer))
    }
}

/// Final report of one transfer. Partial transfers never report success.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferResult {
    pub transfer_id: Uuid,
    pub success: bool,
    pub bytes_transferred: u64,
    pub elapsed: Duration,
    /// Bytes per second over the chunk loop.
    pub average_speed: f64,
    pub verified: bool,
    pub file_checksum: Option<String>,
    pub error: Option<ErrorKind>,
    pub message: Option<String>,
}

/// What a finished chunk loop hands back.
#[derive(Debug)]
pub(crate) struct Delivered {
    pub chunks: u64,
    pub bytes: u64,
    pub file_checksum: String,
    pub loop_elapsed: Duration,
}

/// Per-run state shared by the sender and receiver loops.
pub(crate) struct Run<'a> {
    pub config: &'a Config,
    pub descriptor: &'a mut TransferDescriptor,
    pub cancel: &'a CancelHandle,
    pub tracker: ProgressTracker,
    progress: &'a mut (dyn FnMut(&Progress) + Send),
    pub bytes_done: u64,
}

impl Run<'_> {
    /// Record `bytes_done` at a chunk boundary.
    pub fn report(&mut self, bytes_done: u64) {
        self.bytes_done = bytes_done;
        if let Some(progress) = self.tracker.record(bytes_done) {
            (self.progress)(&progress);
        }
    }
}

pub(crate) fn bytes_per_sec(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        bytes as f64 / secs
    } else {
        0.0
    }
}

/// Checks both peers apply to transfer parameters before any byte moves.
pub(crate) fn check_parameters(config: &Config, size: u64, chunk_size: u32) -> std::result::Result<(), String> {
    if size == 0 {
        return Err("file is empty".into());
    }
    if chunk_size == 0 || chunk_size > config.max_chunk_size {
        return Err(format!(
            "chunk size {} outside 1..={}",
            chunk_size, config.max_chunk_size
        ));
    }
    if let Some(max) = config.max_file_size {
        if size > max {
            return Err(format!("file of {} bytes exceeds the {} byte limit", size, max));
        }
    }
    Ok(())
}

struct Inner {
    config: Config,
    slots: Arc<Semaphore>,
    /// Outbound requests waiting for their `file_transfer_response`.
    requesting: Mutex<BTreeSet<Uuid>>,
}

impl Inner {
    fn requesting(&self) -> MutexGuard<'_, BTreeSet<Uuid>> {
        self.requesting
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Drops an id from the outstanding request set.
struct PendingRequest<'a> {
    inner: &'a Inner,
    id: Uuid,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.inner.requesting().remove(&self.id);
    }
}

#[derive(Clone)]
pub struct TransferEngine {
    inner: Arc<Inner>,
}

impl TransferEngine {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let slots = Arc::new(Semaphore::new(config.max_concurrent_transfers));
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                slots,
                requesting: Mutex::new(BTreeSet::new()),
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Outbound descriptor using the configured chunk size.
    pub fn outbound(&self, file_name: impl Into<String>, total_size: u64) -> TransferDescriptor {
        TransferDescriptor::outbound(file_name, total_size, self.inner.config.chunk_size)
    }

    /// Transfers currently holding a slot.
    pub fn active_transfers(&self) -> usize {
        self.inner.config.max_concurrent_transfers - self.inner.slots.available_permits()
    }

    /// Offer `descriptor` to the peer and wait for its answer.
    ///
    /// On acceptance the descriptor is `awaiting_accept` and the caller
    /// connects to the returned bulk port; otherwise it is `failed`.
    pub async fn request_transfer(&self, session: &Session, descriptor: &mut TransferDescriptor) -> Result<Negotiation> {
        let outcome = self.negotiate(session, descriptor).await;
        match &outcome {
            Ok(Negotiation::Accepted { bulk_port }) => {
                info!(transfer_id = %descriptor.transfer_id, bulk_port, "transfer accepted");
            }
            Ok(Negotiation::Rejected { reason }) => {
                info!(transfer_id = %descriptor.transfer_id, %reason, "transfer rejected");
                descriptor.fail();
            }
            Err(e) => {
                warn!(transfer_id = %descriptor.transfer_id, "transfer request failed: {}", e);
                descriptor.fail();
            }
        }
        outcome
    }

    async fn negotiate(&self, session: &Session, descriptor: &mut TransferDescriptor) -> Result<Negotiation> {
        if descriptor.direction != TransferDirection::Outbound {
            return Err(Error::Protocol("only outbound transfers can be requested".into()));
        }
        descriptor.advance(TransferState::Requesting)?;
        check_parameters(&self.inner.config, descriptor.total_size, descriptor.chunk_size)
            .map_err(Error::Protocol)?;

        let id = descriptor.transfer_id;
        self.inner.requesting().insert(id);
        let _pending = PendingRequest { inner: &self.inner, id };

        let envelope = Envelope::file_transfer_request(&descriptor.offer(session.role()), session.role())?;
        let reply = session
            .request(envelope, self.inner.config.control_message_timeout)
            .await?;
        let answer: FileTransferResponse = reply.payload()?;
        if answer.transfer_id != id {
            return Err(Error::Protocol(format!(
                "response names transfer {}, expected {}",
                answer.transfer_id, id
            )));
        }

        if answer.accepted && answer.ready_for_transfer {
            descriptor.advance(TransferState::AwaitingAccept)?;
            Ok(Negotiation::Accepted {
                bulk_port: answer.tcp_port,
            })
        } else {
            Ok(Negotiation::Rejected {
                reason: answer.error_message.unwrap_or_else(|| "declined".into()),
            })
        }
    }

    /// Answer the peer's `file_transfer_request`s with `policy`.
    ///
    /// Accepted offers arrive on the returned channel as `awaiting_accept`
    /// descriptors. The policy runs on the control reader task and must
    /// not block.
    pub fn accept_offers<F>(&self, session: &Session, policy: F) -> mpsc::UnboundedReceiver<TransferDescriptor>
    where
        F: Fn(&TransferDescriptor) -> OfferDecision + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = self.clone();
        let role = session.role();
        session.on_request(Action::FileTransferRequest, move |envelope| {
            let offer: FileTransferRequest = match envelope.payload() {
                Ok(offer) => offer,
                Err(e) => return Some(Reply::Err(ErrorPayload::new(ErrorCode::E007, e.to_string()))),
            };
            let (answer, accepted) = engine.answer_offer(&offer, &policy);
            if let Some(descriptor) = accepted {
                if tx.send(descriptor).is_err() {
                    warn!(transfer_id = %offer.transfer_id, "accepted offer has no consumer");
                }
            }
            match envelope.file_transfer_response(&answer, role) {
                Ok(reply) => Some(Reply::Ok(reply.data)),
                Err(e) => Some(Reply::Err(ErrorPayload::new(ErrorCode::E004, e.to_string()))),
            }
        });
        rx
    }

    fn answer_offer<F>(&self, offer: &FileTransferRequest, policy: &F) -> (FileTransferResponse, Option<TransferDescriptor>)
    where
        F: Fn(&TransferDescriptor) -> OfferDecision,
    {
        let mut descriptor = TransferDescriptor::from(offer);
        let decision = self.screen_offer(offer).unwrap_or_else(|| policy(&descriptor));

        match decision {
            OfferDecision::Accept { bulk_port } => {
                let advanced = descriptor
                    .advance(TransferState::Requesting)
                    .and_then(|_| descriptor.advance(TransferState::AwaitingAccept));
                if let Err(e) = advanced {
                    return (rejection(offer, e.to_string()), None);
                }
                info!(transfer_id = %offer.transfer_id, file = %offer.file_name, size = offer.file_size, "offer accepted");
                let answer = FileTransferResponse {
                    transfer_id: offer.transfer_id,
                    accepted: true,
                    tcp_port: bulk_port,
                    ready_for_transfer: true,
                    error_message: None,
                };
                (answer, Some(descriptor))
            }
            OfferDecision::Reject { reason } => {
                info!(transfer_id = %offer.transfer_id, %reason, "offer rejected");
                (rejection(offer, reason), None)
            }
        }
    }

    /// Engine-level reasons to turn an offer down before the policy sees it.
    fn screen_offer(&self, offer: &FileTransferRequest) -> Option<OfferDecision> {
        let reject = |reason: String| Some(OfferDecision::Reject { reason });

        if let Err(reason) = check_parameters(&self.inner.config, offer.file_size, offer.chunk_size) {
            return reject(reason);
        }
        // Lowest transfer id wins; the peer applies the same rule.
        if let Some(ours) = self.inner.requesting().first() {
            if *ours < offer.transfer_id {
                debug!(ours = %ours, theirs = %offer.transfer_id, "simultaneous offers, ours wins");
                return reject(CONFLICT.to_string());
            }
        }
        if self.inner.slots.available_permits() == 0 {
            return reject(format!(
                "{} transfers already active",
                self.inner.config.max_concurrent_transfers
            ));
        }
        None
    }

    /// Reserve a transfer slot before opening the bulk transport.
    pub fn admit(&self, descriptor: TransferDescriptor) -> Result<TransferPermit> {
        if !descriptor.state.can_transition_to(TransferState::Transferring) {
            return Err(Error::InvalidTransition {
                from: descriptor.state.to_string(),
                to: TransferState::Transferring.to_string(),
            });
        }
        let slot = self.inner.slots.clone().try_acquire_owned().map_err(|_| {
            Error::TooManyConcurrentTransfers {
                limit: self.inner.config.max_concurrent_transfers,
            }
        })?;
        debug!(transfer_id = %descriptor.transfer_id, "transfer admitted");
        Ok(TransferPermit {
            descriptor,
            cancel: CancelHandle::default(),
            _slot: slot,
        })
    }

    /// Drive one admitted transfer over `transport` to completion.
    ///
    /// `progress` is called at chunk boundaries, throttled.
    pub async fn run_transfer<T, P>(
        &self,
        permit: TransferPermit,
        transport: T,
        io: TransferIo,
        mut progress: P,
    ) -> TransferResult
    where
        T: BulkTransport,
        P: FnMut(&Progress) + Send,
    {
        let TransferPermit {
            mut descriptor,
            cancel,
            _slot,
        } = permit;
        let started = Instant::now();
        let config = &self.inner.config;
        let mut link = BulkLink::new(transport, config.max_frame_size);

        let mut run = Run {
            config,
            tracker: ProgressTracker::new(descriptor.transfer_id, descriptor.total_size),
            descriptor: &mut descriptor,
            cancel: &cancel,
            progress: &mut progress,
            bytes_done: 0,
        };
        let outcome = match (run.descriptor.direction, io) {
            (TransferDirection::Outbound, TransferIo::Source(source)) => {
                sender::send(&mut run, &mut link, source).await
            }
            (TransferDirection::Inbound, TransferIo::Sink(sink)) => {
                receiver::receive(&mut run, &mut link, sink).await
            }
            (direction, _) => Err(Error::Protocol(format!(
                "{direction:?} transfer given the wrong side of the stream"
            ))),
        };
        let bytes_done = run.bytes_done;

        if let Err(e) = link.close().await {
            debug!("bulk transport close: {}", e);
        }

        let transfer_id = descriptor.transfer_id;
        match outcome {
            Ok(delivered) => {
                if let Err(e) = descriptor.advance(TransferState::Completed) {
                    warn!(%transfer_id, "{}", e);
                }
                let average_speed = bytes_per_sec(delivered.bytes, delivered.loop_elapsed);
                info!(
                    %transfer_id,
                    chunks = delivered.chunks,
                    bytes = delivered.bytes,
                    "transfer complete ({:.0} B/s)",
                    average_speed
                );
                TransferResult {
                    transfer_id,
                    success: true,
                    bytes_transferred: delivered.bytes,
                    elapsed: started.elapsed(),
                    average_speed,
                    verified: true,
                    file_checksum: Some(delivered.file_checksum),
                    error: None,
                    message: None,
                }
            }
            Err(e) => {
                descriptor.fail();
                warn!(%transfer_id, "transfer failed: {}", e);
                let elapsed = started.elapsed();
                TransferResult {
                    transfer_id,
                    success: false,
                    bytes_transferred: bytes_done,
                    elapsed,
                    average_speed: bytes_per_sec(bytes_done, elapsed),
                    verified: false,
                    file_checksum: None,
                    error: Some(e.kind()),
                    message: Some(e.to_string()),
                }
            }
        }
    }
}

fn rejection(offer: &FileTransferRequest, reason: String) -> FileTransferResponse {
    FileTransferResponse {
        transfer_id: offer.transfer_id,
        accepted: false,
        tcp_port: 0,
        ready_for_transfer: false,
        error_message: Some(reason),
    }
}
