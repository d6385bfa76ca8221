//! Session coordination and chunked file transfer between a mobile and a
//! desktop peer.
//!
//! A low-bandwidth control link ([`session::Session`] over a
//! [`channel::ControlChannel`]) carries commands and negotiation; files move
//! over a separate bulk link driven by [`transfer::TransferEngine`].

pub mod backoff;
pub mod channel;
pub mod checksum;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod session;
pub mod transfer;
pub mod transport;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use protocol::{Action, Envelope, MessageType, Role};
pub use session::{LinkState, NetworkState, Session, SessionEvent, SessionSnapshot};
pub use transfer::{
    Negotiation, OfferDecision, Progress, TransferDescriptor, TransferEngine, TransferIo, TransferPermit,
    TransferResult,
};
