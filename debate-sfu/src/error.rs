//! SFU error taxonomy

use serde::Serialize;
use thiserror::Error;

use crate::types::{ConsumerId, PeerId, ProducerId, RoomId, TransportId};

#[derive(Error, Debug)]
pub enum SfuError {
    #[error("Room does not exist: {0}")]
    RoomNotFound(RoomId),

    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    #[error("Transport not found: {0}")]
    TransportNotFound(TransportId),

    #[error("Producer not found: {0}")]
    ProducerNotFound(ProducerId),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(ConsumerId),

    #[error("Room already exists: {0}")]
    AlreadyExists(RoomId),

    #[error("Peer already joined: {0}")]
    PeerExists(PeerId),

    #[error("Only the room owner can start the debate")]
    NotOwner,

    #[error("The debate has already started")]
    AlreadyStarted,

    #[error("The room is full")]
    RoomFull,

    #[error("Invalid seat ({team}, {order})")]
    InvalidSeat { team: usize, order: usize },

    #[error("Capacity reached: {0}")]
    Capacity(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("No free recorder port left in {min}..={max}")]
    ResourceExhausted { min: u16, max: u16 },

    #[error("Recording process failure: {0}")]
    Process(String),

    #[error("Invalid recording description: {0}")]
    InvalidDescription(String),

    #[error("Media engine error: {0}")]
    Engine(String),

    #[error("Invalid debate: {0}")]
    InvalidDebate(String),

    #[error("Report delivery failed: {0}")]
    Report(String),

    #[error("Peer or room already closed")]
    Closed,
}

/// Error class reported to signaling clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    NotFound,
    AlreadyExists,
    Unauthorized,
    Capacity,
    InvalidState,
    NegotiationFailure,
    ResourceExhausted,
    ProcessFailure,
    Internal,
}

impl ErrorCode {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::AlreadyExists => "AlreadyExists",
            Self::Unauthorized => "Unauthorized",
            Self::Capacity => "Capacity",
            Self::InvalidState => "InvalidState",
            Self::NegotiationFailure => "NegotiationFailure",
            Self::ResourceExhausted => "ResourceExhausted",
            Self::ProcessFailure => "ProcessFailure",
            Self::Internal => "Internal",
        }
    }
}

impl SfuError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::RoomNotFound(_)
            | Self::PeerNotFound(_)
            | Self::TransportNotFound(_)
            | Self::ProducerNotFound(_)
            | Self::ConsumerNotFound(_) => ErrorCode::NotFound,
            Self::AlreadyExists(_) | Self::PeerExists(_) => ErrorCode::AlreadyExists,
            Self::NotOwner => ErrorCode::Unauthorized,
            Self::RoomFull | Self::Capacity(_) => ErrorCode::Capacity,
            Self::AlreadyStarted | Self::InvalidSeat { .. } | Self::InvalidDebate(_) | Self::Closed => {
                ErrorCode::InvalidState
            }
            Self::Negotiation(_) => ErrorCode::NegotiationFailure,
            Self::ResourceExhausted { .. } => ErrorCode::ResourceExhausted,
            Self::Process(_) | Self::InvalidDescription(_) => ErrorCode::ProcessFailure,
            Self::Engine(_) | Self::Report(_) => ErrorCode::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, SfuError>;
