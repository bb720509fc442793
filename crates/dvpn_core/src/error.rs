use thiserror::Error;

use crate::{admission::AdmissionError, peer_service::PeerServiceError};

/// Represents kinds of error that occurred while serving a request
#[derive(Debug, Error)]
pub enum WebError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Peer service error: {0}")]
    PeerService(#[from] PeerServiceError),
}
