pub mod routes;
pub mod server;
pub mod websocket;

use axum::http::StatusCode;

use crate::error::{ConnectionError, SessionError};

/// Route error shape: status plus a human-readable message.
pub type ApiError = (StatusCode, String);

pub fn error_response(err: SessionError) -> ApiError {
    let status = match &err {
        SessionError::Connection(ConnectionError::MalformedSessionId(_)) => StatusCode::BAD_REQUEST,
        SessionError::Connection(_) => StatusCode::BAD_GATEWAY,
        SessionError::Policy(_) => StatusCode::CONFLICT,
        SessionError::Protocol(_) => StatusCode::BAD_REQUEST,
        SessionError::Hardware(_) | SessionError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{HardwareError, PolicyError};

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (ConnectionError::JoinTimedOut.into(), StatusCode::BAD_GATEWAY),
            (
                ConnectionError::MalformedSessionId("x".into()).into(),
                StatusCode::BAD_REQUEST,
            ),
            (PolicyError::BlockedBySilence.into(), StatusCode::CONFLICT),
            (HardwareError::NoAudioFocus.into(), StatusCode::SERVICE_UNAVAILABLE),
            (SessionError::Unavailable, StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (err, status) in cases {
            assert_eq!(error_response(err).0, status);
        }
    }
}
