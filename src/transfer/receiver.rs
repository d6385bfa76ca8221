use tokio::io::AsyncWrite;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::chunker::{Assembler, ChunkRecord, Placement};
use super::wire::{AckStatus, BulkFrame, BulkLink, HandshakeStatus};
use super::{check_parameters, Delivered, Run};
use crate::checksum;
use crate::error::{Error, Result};
use crate::session::TransferState;
use crate::transport::BulkTransport;

pub(crate) async fn receive<T: BulkTransport>(
    run: &mut Run<'_>,
    link: &mut BulkLink<T>,
    sink: Box<dyn AsyncWrite + Send + Unpin>,
) -> Result<Delivered> {
    let config = run.config;
    let expected_id = run.descriptor.transfer_id;

    let (size, chunk_size) = match link
        .recv_within(config.handshake_timeout, "transfer handshake")
        .await
    {
        Ok(BulkFrame::Handshake {
            transfer_id,
            name,
            size,
            chunk_size,
            ..
        }) => {
            if let Err(reason) = validate_handshake(run, transfer_id, size, chunk_size) {
                warn!(%transfer_id, "refusing transfer: {}", reason);
                let reply = BulkFrame::HandshakeReply {
                    status: HandshakeStatus::Error,
                    transfer_id,
                    message: Some(reason.clone()),
                };
                if let Err(e) = link.send(&reply).await {
                    debug!("handshake refusal not delivered: {}", e);
                }
                return Err(Error::HandshakeRejected(reason));
            }
            info!(%transfer_id, file = %name, size, chunk_size, "receiving");
            (size, chunk_size)
        }
        Ok(other) => {
            return Err(Error::Protocol(format!(
                "expected handshake, got {}",
                other.name()
            )))
        }
        Err(Error::Timeout { .. }) => return Err(Error::HandshakeTimeout(config.handshake_timeout)),
        Err(e) => return Err(e),
    };

    link.send(&BulkFrame::HandshakeReply {
        status: HandshakeStatus::Ready,
        transfer_id: expected_id,
        message: None,
    })
    .await?;
    run.descriptor.advance(TransferState::Transferring)?;
    run.tracker.start();

    let mut assembler = Assembler::new(sink, size);
    // The sender may spend every attempt of a chunk, and the backoff
    // between attempts, before the next frame.
    let attempts = config.max_retries_per_chunk;
    let idle = config
        .chunk_timeout
        .saturating_mul(attempts.saturating_add(1))
        .saturating_add(config.chunk_retry.max.saturating_mul(attempts.saturating_sub(1)));

    loop {
        match link.recv_within(idle, "next chunk").await? {
            BulkFrame::ChunkHeader {
                chunk_id,
                chunk_size: len,
                chunk_checksum,
                is_last,
            } => {
                if len == 0 || len > config.max_chunk_size {
                    return Err(Error::Protocol(format!(
                        "chunk {chunk_id} announces {len} bytes"
                    )));
                }
                let data = link.read_payload(len as usize).await?;

                if run.cancel.is_cancelled() {
                    let ack = BulkFrame::ack(chunk_id, AckStatus::Cancelled, Some("cancelled by receiver".into()));
                    if let Err(e) = link.send(&ack).await {
                        debug!("cancel ack not delivered: {}", e);
                    }
                    return Err(Error::Cancelled);
                }

                let (status, message) = if len > chunk_size {
                    (
                        AckStatus::Error,
                        Some(format!("chunk of {len} bytes exceeds negotiated {chunk_size}")),
                    )
                } else {
                    let record = ChunkRecord {
                        chunk_id,
                        size: len,
                        checksum: chunk_checksum,
                        is_last,
                    };
                    match assembler.accept(&record, &data).await? {
                        Placement::Written => {
                            run.report(assembler.bytes_written());
                            (AckStatus::Received, None)
                        }
                        Placement::Duplicate => {
                            debug!(chunk_id, "duplicate chunk acknowledged again");
                            (AckStatus::Received, None)
                        }
                        Placement::Corrupt { actual } => {
                            warn!(chunk_id, %actual, "chunk checksum mismatch");
                            (AckStatus::Error, Some(format!("checksum mismatch on chunk {chunk_id}")))
                        }
                        Placement::OutOfOrder { expected } => (
                            AckStatus::Error,
                            Some(format!("expected chunk {expected}, got {chunk_id}")),
                        ),
                    }
                };
                link.send(&BulkFrame::ack(chunk_id, status, message)).await?;
            }
            BulkFrame::Complete {
                total_chunks,
                total_bytes,
                file_checksum: theirs,
                ..
            } => {
                let loop_elapsed = run.tracker.elapsed();
                run.descriptor.advance(TransferState::Verifying)?;
                let chunks = assembler.chunks_written();
                let written = assembler.bytes_written();
                let ours = assembler.finalize().await?;

                let problem = if written != size || total_bytes != size {
                    Some(format!("received {written} of {size} bytes"))
                } else if chunks != total_chunks {
                    Some(format!("received {chunks} of {total_chunks} chunks"))
                } else if !checksum::matches(&theirs, &ours) {
                    Some("file checksum mismatch".to_string())
                } else {
                    None
                };
                let verified = problem.is_none();
                link.send(&BulkFrame::Verdict {
                    verified,
                    file_checksum: ours.clone(),
                    message: problem,
                })
                .await?;

                return if verified {
                    Ok(Delivered {
                        chunks,
                        bytes: written,
                        file_checksum: ours,
                        loop_elapsed,
                    })
                } else {
                    Err(Error::ChecksumMismatch {
                        expected: theirs,
                        actual: ours,
                    })
                };
            }
            BulkFrame::Abort { reason } => {
                info!(transfer_id = %expected_id, "sender aborted: {}", reason);
                return Err(Error::Cancelled);
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected {} during transfer",
                    other.name()
                )))
            }
        }
    }
}

fn validate_handshake(run: &Run<'_>, transfer_id: Uuid, size: u64, chunk_size: u32) -> std::result::Result<(), String> {
    let descriptor = &run.descriptor;
    if transfer_id != descriptor.transfer_id {
        return Err(format!("unexpected transfer {transfer_id}"));
    }
    check_parameters(run.config, size, chunk_size)?;
    if size != descriptor.total_size || chunk_size != descriptor.chunk_size {
        return Err(format!(
            "parameters differ from the accepted offer ({} bytes in {} byte chunks)",
            descriptor.total_size, descriptor.chunk_size
        ));
    }
    Ok(())
}
