//! Frames exchanged on the bulk link.
//!
//! Every frame is length-prefixed JSON; a `chunk_header` frame is followed by
//! exactly `chunk_size` raw bytes with no delimiter.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::checksum::ChecksumAlgorithm;
use crate::error::{Error, Result};
use crate::network::Connection;
use crate::transport::BulkTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandshakeStatus {
    Ready,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Received,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BulkFrame {
    Handshake {
        transfer_id: Uuid,
        name: String,
        size: u64,
        checksum_algorithm: ChecksumAlgorithm,
        chunk_size: u32,
    },
    HandshakeReply {
        status: HandshakeStatus,
        transfer_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    ChunkHeader {
        chunk_id: u64,
        chunk_size: u32,
        chunk_checksum: String,
        is_last: bool,
    },
    ChunkAck {
        chunk_id: u64,
        status: AckStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Complete {
        total_chunks: u64,
        total_bytes: u64,
        elapsed_ms: u64,
        average_speed: f64,
        file_checksum: String,
    },
    Verdict {
        verified: bool,
        file_checksum: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Abort {
        reason: String,
    },
}

impl BulkFrame {
    pub fn name(&self) -> &'static str {
        match self {
            BulkFrame::Handshake { .. } => "handshake",
            BulkFrame::HandshakeReply { .. } => "handshake_reply",
            BulkFrame::ChunkHeader { .. } => "chunk_header",
            BulkFrame::ChunkAck { .. } => "chunk_ack",
            BulkFrame::Complete { .. } => "complete",
            BulkFrame::Verdict { .. } => "verdict",
            BulkFrame::Abort { .. } => "abort",
        }
    }

    pub fn ack(chunk_id: u64, status: AckStatus, message: Option<String>) -> Self {
        BulkFrame::ChunkAck {
            chunk_id,
            status,
            message,
        }
    }
}

/// A bulk transport speaking [`BulkFrame`]s.
pub struct BulkLink<T> {
    conn: Connection<T>,
}

impl<T: BulkTransport> BulkLink<T> {
    pub fn new(transport: T, max_frame: usize) -> Self {
        Self {
            conn: Connection::new(transport, max_frame),
        }
    }

    pub async fn send(&mut self, frame: &BulkFrame) -> Result<()> {
        let body = serde_json::to_vec(frame)
            .map_err(|e| Error::Protocol(format!("encode {}: {e}", frame.name())))?;
        self.conn.send(&body).await
    }

    pub async fn recv(&mut self) -> Result<BulkFrame> {
        let body = self.conn.receive().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// [`BulkLink::recv`] bounded by `timeout`.
    pub async fn recv_within(&mut self, timeout: Duration, what: &str) -> Result<BulkFrame> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(frame) => frame,
            Err(_) => Err(Error::timeout(what, timeout)),
        }
    }

    /// A chunk header followed by its payload.
    pub async fn send_chunk(&mut self, header: &BulkFrame, data: &[u8]) -> Result<()> {
        self.send(header).await?;
        self.conn.send_raw(data).await
    }

    pub async fn read_payload(&mut self, size: usize) -> Result<Vec<u8>> {
        self.conn.receive_raw(size).await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.conn.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_frame_shapes() {
        let frame = BulkFrame::ChunkHeader {
            chunk_id: 3,
            chunk_size: 1024,
            chunk_checksum: "ab".into(),
            is_last: true,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "chunk_header");
        assert_eq!(value["chunk_id"], 3);
        assert_eq!(value["is_last"], true);

        let ack = serde_json::to_value(BulkFrame::ack(3, AckStatus::Received, None)).unwrap();
        assert_eq!(ack["status"], "received");
        assert!(ack.get("message").is_none());

        let handshake = BulkFrame::Handshake {
            transfer_id: Uuid::nil(),
            name: "a.bin".into(),
            size: 1,
            checksum_algorithm: ChecksumAlgorithm::Sha256,
            chunk_size: 1,
        };
        let value: Value = serde_json::to_value(handshake).unwrap();
        assert_eq!(value["checksum_algorithm"], "SHA256");
    }

    #[tokio::test]
    async fn test_chunk_travels_with_header() {
        let (a, b) = tokio::io::duplex(4096);
        let mut left = BulkLink::new(a, 1024);
        let mut right = BulkLink::new(b, 1024);

        let header = BulkFrame::ChunkHeader {
            chunk_id: 0,
            chunk_size: 5,
            chunk_checksum: crate::checksum::checksum(b"hello"),
            is_last: true,
        };
        left.send_chunk(&header, b"hello").await.unwrap();

        assert_eq!(right.recv().await.unwrap(), header);
        assert_eq!(right.read_payload(5).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_recv_within_times_out() {
        let (a, _b) = tokio::io::duplex(64);
        let mut link = BulkLink::new(a, 64);
        let err = link
            .recv_within(Duration::from_millis(20), "ack")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_timeout_mid_frame_keeps_stream_aligned() {
        let (a, mut b) = tokio::io::duplex(4096);
        let mut link = BulkLink::new(a, 1024);
        let ack = BulkFrame::ack(7, AckStatus::Received, None);
        let body = serde_json::to_vec(&ack).unwrap();
        let mut framed = (body.len() as u32).to_be_bytes().to_vec();
        framed.extend_from_slice(&body);
        let (head, tail) = framed.split_at(6);

        b.write_all(head).await.unwrap();
        let err = link
            .recv_within(Duration::from_millis(20), "ack")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));

        b.write_all(tail).await.unwrap();
        assert_eq!(link.recv().await.unwrap(), ack);
    }

    #[tokio::test]
    async fn test_garbage_is_decode_error() {
        let (a, mut b) = tokio::io::duplex(64);
        crate::network::write_frame(&mut b, b"{\"type\":\"nope\"}").await.unwrap();
        let mut link = BulkLink::new(a, 64);
        assert!(matches!(link.recv().await, Err(Error::Decode(_))));
    }
}
