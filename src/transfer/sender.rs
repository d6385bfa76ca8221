use std::time::Duration;
use tokio::io::AsyncRead;
use tracing::{debug, info, trace, warn};

use super::chunker::{ChunkRecord, Chunker};
use super::wire::{AckStatus, BulkFrame, BulkLink, HandshakeStatus};
use super::{bytes_per_sec, Delivered, Run};
use crate::backoff::Backoff;
use crate::checksum;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::session::TransferState;
use crate::transport::BulkTransport;

pub(crate) async fn send<T: BulkTransport>(
    run: &mut Run<'_>,
    link: &mut BulkLink<T>,
    source: Box<dyn AsyncRead + Send + Unpin>,
) -> Result<Delivered> {
    let config = run.config;
    let transfer_id = run.descriptor.transfer_id;
    let total_size = run.descriptor.total_size;
    let chunk_size = run.descriptor.chunk_size;

    link.send(&BulkFrame::Handshake {
        transfer_id,
        name: run.descriptor.file_name.clone(),
        size: total_size,
        checksum_algorithm: run.descriptor.checksum_algorithm,
        chunk_size,
    })
    .await?;

    match link
        .recv_within(config.handshake_timeout, "transfer handshake reply")
        .await
    {
        Ok(BulkFrame::HandshakeReply {
            status: HandshakeStatus::Ready,
            transfer_id: id,
            ..
        }) if id == transfer_id => {}
        Ok(BulkFrame::HandshakeReply {
            status: HandshakeStatus::Ready,
            transfer_id: id,
            ..
        }) => {
            return Err(Error::HandshakeRejected(format!(
                "receiver is ready for transfer {id}, not {transfer_id}"
            )))
        }
        Ok(BulkFrame::HandshakeReply { message, .. }) => {
            return Err(Error::HandshakeRejected(
                message.unwrap_or_else(|| "receiver not ready".into()),
            ))
        }
        Ok(other) => {
            return Err(Error::Protocol(format!(
                "expected handshake_reply, got {}",
                other.name()
            )))
        }
        Err(Error::Timeout { .. }) => return Err(Error::HandshakeTimeout(config.handshake_timeout)),
        Err(e) => return Err(e),
    }

    run.descriptor.advance(TransferState::Transferring)?;
    run.tracker.start();
    info!(%transfer_id, size = total_size, chunk_size, "sending");

    let mut chunker = Chunker::new(source, total_size, chunk_size);
    let mut chunks = 0u64;
    while let Some((record, data)) = chunker.next_chunk().await? {
        if run.cancel.is_cancelled() {
            let abort = BulkFrame::Abort {
                reason: "cancelled by sender".into(),
            };
            if let Err(e) = link.send(&abort).await {
                debug!("abort not delivered: {}", e);
            }
            return Err(Error::Cancelled);
        }
        deliver_chunk(config, link, &record, &data).await?;
        chunks += 1;
        run.report(chunker.bytes_read());
    }

    let loop_elapsed = run.tracker.elapsed();
    run.descriptor.advance(TransferState::Verifying)?;
    let file_checksum = chunker.finish();
    link.send(&BulkFrame::Complete {
        total_chunks: chunks,
        total_bytes: total_size,
        elapsed_ms: loop_elapsed.as_millis() as u64,
        average_speed: bytes_per_sec(total_size, loop_elapsed),
        file_checksum: file_checksum.clone(),
    })
    .await?;

    match link.recv_within(config.chunk_timeout, "verdict").await? {
        BulkFrame::Verdict {
            verified: true,
            file_checksum: theirs,
            ..
        } if checksum::matches(&file_checksum, &theirs) => Ok(Delivered {
            chunks,
            bytes: total_size,
            file_checksum,
            loop_elapsed,
        }),
        BulkFrame::Verdict {
            file_checksum: theirs,
            message,
            ..
        } => {
            if let Some(message) = message {
                warn!(%transfer_id, "receiver could not verify: {}", message);
            }
            Err(Error::ChecksumMismatch {
                expected: file_checksum,
                actual: theirs,
            })
        }
        BulkFrame::Abort { reason } => {
            info!(%transfer_id, "receiver aborted: {}", reason);
            Err(Error::Cancelled)
        }
        other => Err(Error::Protocol(format!(
            "expected verdict, got {}",
            other.name()
        ))),
    }
}

/// Send one chunk until it is acknowledged or attempts run out.
async fn deliver_chunk<T: BulkTransport>(
    config: &Config,
    link: &mut BulkLink<T>,
    record: &ChunkRecord,
    data: &[u8],
) -> Result<()> {
    let header = BulkFrame::ChunkHeader {
        chunk_id: record.chunk_id,
        chunk_size: record.size,
        chunk_checksum: record.checksum.clone(),
        is_last: record.is_last,
    };
    let attempts = config.max_retries_per_chunk;
    let mut backoff = Backoff::new(config.chunk_retry.clone());

    for attempt in 1..=attempts {
        link.send_chunk(&header, data).await?;
        match await_ack(link, record.chunk_id, config.chunk_timeout).await {
            Ok(AckStatus::Received) => {
                trace!(chunk_id = record.chunk_id, attempt, "chunk acknowledged");
                return Ok(());
            }
            Ok(AckStatus::Cancelled) => return Err(Error::Cancelled),
            Ok(AckStatus::Error) => {
                warn!(chunk_id = record.chunk_id, attempt, "receiver rejected chunk");
            }
            Err(Error::Timeout { after, .. }) => {
                warn!(chunk_id = record.chunk_id, attempt, "no ack within {:?}", after);
            }
            Err(e) => return Err(e),
        }
        if attempt < attempts {
            tokio::time::sleep(backoff.next_delay()).await;
        }
    }

    Err(Error::ChunkTransferFailed {
        chunk_id: record.chunk_id,
        attempts,
    })
}

/// Wait for the ack of `chunk_id`, skipping stale acks of earlier chunks.
async fn await_ack<T: BulkTransport>(
    link: &mut BulkLink<T>,
    chunk_id: u64,
    timeout: Duration,
) -> Result<AckStatus> {
    let wait = async {
        loop {
            match link.recv().await? {
                BulkFrame::ChunkAck {
                    chunk_id: acked,
                    status,
                    message,
                } if acked == chunk_id => {
                    if let Some(message) = message {
                        debug!(chunk_id, "ack message: {}", message);
                    }
                    return Ok(status);
                }
                BulkFrame::ChunkAck { chunk_id: acked, .. } if acked < chunk_id => {
                    debug!(acked, chunk_id, "ignoring stale ack");
                }
                BulkFrame::Abort { reason } => {
                    info!("receiver aborted: {}", reason);
                    return Err(Error::Cancelled);
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "expected chunk_ack for {}, got {}",
                        chunk_id,
                        other.name()
                    )))
                }
            }
        }
    };
    match tokio::time::timeout(timeout, wait).await {
        Ok(status) => status,
        Err(_) => Err(Error::timeout(format!("ack of chunk {chunk_id}"), timeout)),
    }
}
