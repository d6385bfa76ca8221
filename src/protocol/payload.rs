//! Typed `data` payloads for the known actions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::Role;
use crate::checksum::ChecksumAlgorithm;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Color {
    Red,
    Yellow,
    Green,
}

impl FromStr for Color {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RED" => Ok(Color::Red),
            "YELLOW" => Ok(Color::Yellow),
            "GREEN" => Ok(Color::Green),
            other => Err(format!("unknown color {other}")),
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Color::Red => "RED",
            Color::Yellow => "YELLOW",
            Color::Green => "GREEN",
        };
        f.write_str(s)
    }
}

/// `color_change` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorChange {
    pub color: Color,
}

/// `color_change_ack` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorChangeAck {
    pub success: bool,
    pub current_color: Color,
}

/// Exchanged as a `handshake` request/response when a control link opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    pub protocol_version: String,
    pub role: Role,
}

/// `wifi_hotspot_info` notification: how to reach the producer's access point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotspotInfo {
    pub ssid: String,
    pub password: String,
    pub ip_address: String,
    pub port: u16,
    #[serde(default = "default_security_type")]
    pub security_type: String,
}

fn default_security_type() -> String {
    "WPA2".to_string()
}

impl HotspotInfo {
    pub fn new(ssid: impl Into<String>, password: impl Into<String>, ip_address: impl Into<String>, port: u16) -> Self {
        Self {
            ssid: ssid.into(),
            password: password.into(),
            ip_address: ip_address.into(),
            port,
            security_type: default_security_type(),
        }
    }
}

/// `wifi_connection_status` notification from the consumer side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `file_transfer_request`: one side proposes a transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTransferRequest {
    pub transfer_id: Uuid,
    pub file_name: String,
    pub file_size: u64,
    /// Direction from the requester's point of view.
    pub transfer_direction: String,
    pub checksum_type: ChecksumAlgorithm,
    pub chunk_size: u32,
    #[serde(default)]
    pub compression: bool,
}

/// `file_transfer_response`: the peer's decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTransferResponse {
    pub transfer_id: Uuid,
    pub accepted: bool,
    pub tcp_port: u16,
    pub ready_for_transfer: bool,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Control link connection failed.
    E001,
    /// Hotspot creation failed.
    E002,
    /// Joining the bulk network failed.
    E003,
    /// File transfer initialization failed.
    E004,
    /// File transfer interrupted.
    E005,
    /// Checksum verification failed.
    E006,
    /// Invalid message format.
    E007,
    /// Unsupported operation.
    E008,
}

impl ErrorCode {
    pub fn error_type(&self) -> &'static str {
        match self {
            ErrorCode::E001 => "control_link",
            ErrorCode::E002 => "hotspot",
            ErrorCode::E003 => "network_join",
            ErrorCode::E004 => "transfer_init",
            ErrorCode::E005 => "transfer_interrupted",
            ErrorCode::E006 => "checksum",
            ErrorCode::E007 => "invalid_message",
            ErrorCode::E008 => "unsupported",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// `data` of an `error` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error_code: ErrorCode,
    pub error_type: String,
    pub error_message: String,
    #[serde(default)]
    pub recovery_suggestions: Vec<String>,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code: code,
            error_type: code.error_type().to_string(),
            error_message: message.into(),
            recovery_suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.recovery_suggestions.push(suggestion.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::to_data;

    #[test]
    fn test_color_parse() {
        assert_eq!("red".parse::<Color>().unwrap(), Color::Red);
        assert_eq!("GREEN".parse::<Color>().unwrap(), Color::Green);
        assert!("blue".parse::<Color>().is_err());
    }

    #[test]
    fn test_hotspot_info_defaults_security() {
        let info: HotspotInfo = serde_json::from_str(
            r#"{"ssid":"SynergyDemo","password":"synergy123","ip_address":"192.168.43.1","port":8888}"#,
        )
        .unwrap();
        assert_eq!(info.security_type, "WPA2");
    }

    #[test]
    fn test_transfer_request_shape() {
        let request = FileTransferRequest {
            transfer_id: Uuid::nil(),
            file_name: "photo.jpg".into(),
            file_size: 2048,
            transfer_direction: "outbound".into(),
            checksum_type: ChecksumAlgorithm::Sha256,
            chunk_size: 1024,
            compression: false,
        };
        let data = to_data(&request).unwrap();
        assert_eq!(data["checksum_type"], "SHA256");
        assert_eq!(data["file_size"], 2048);
    }

    #[test]
    fn test_error_payload() {
        let payload = ErrorPayload::new(ErrorCode::E006, "bad sum").with_suggestion("retry");
        let data = to_data(&payload).unwrap();
        assert_eq!(data["error_code"], "E006");
        assert_eq!(data["error_type"], "checksum");
        assert_eq!(data["recovery_suggestions"][0], "retry");
    }
}
