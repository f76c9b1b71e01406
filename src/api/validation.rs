use thiserror::Error;

use super::models::SubmitRequest;

const MAX_SOURCE_URL_BYTES: usize = 2048;
const MAX_REQUESTER_BYTES: usize = 256;

#[derive(Debug, Error, PartialEq)]
pub enum SubmitValidationError {
    #[error("source_url must be an http/https url")]
    InvalidSourceUrl,
    #[error("source_url exceeds {MAX_SOURCE_URL_BYTES} bytes")]
    SourceUrlTooLong,
    #[error("requester must not be empty")]
    EmptyRequester,
    #[error("requester exceeds {MAX_REQUESTER_BYTES} bytes")]
    RequesterTooLong,
}

/// Cheap shape checks before the request reaches the queue
pub fn validate_submission(request: &SubmitRequest) -> Result<(), SubmitValidationError> {
    let url = request.source_url.trim();
    if url.len() > MAX_SOURCE_URL_BYTES {
        return Err(SubmitValidationError::SourceUrlTooLong);
    }
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(SubmitValidationError::InvalidSourceUrl);
    }

    if request.requester.trim().is_empty() {
        return Err(SubmitValidationError::EmptyRequester);
    }
    if request.requester.len() > MAX_REQUESTER_BYTES {
        return Err(SubmitValidationError::RequesterTooLong);
    }

    Ok(())
}
