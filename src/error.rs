//! Synthetic error responses emitted by the dispatcher itself.
//!
//! These never reach a backend; they are generated at the request boundary
//! when routing or forwarding fails.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};

/// Why the dispatcher answered a request itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchErrorCode {
    /// The request carried no usable Host header.
    MissingHostHeader,
    /// No Service is registered for the presented host.
    UnknownHost,
    /// The backend could not be reached or failed mid-request.
    ConnectionFailed,
    /// The backend rejected or broke an upgrade handshake.
    UpgradeFailed,
}

impl DispatchErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            // An unroutable request, whether the host is absent or simply
            // not configured, is answered with the same synthetic 500.
            DispatchErrorCode::MissingHostHeader => StatusCode::INTERNAL_SERVER_ERROR,
            DispatchErrorCode::UnknownHost => StatusCode::INTERNAL_SERVER_ERROR,
            DispatchErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            DispatchErrorCode::UpgradeFailed => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn as_header_value(&self) -> &'static str {
        match self {
            DispatchErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            DispatchErrorCode::UnknownHost => "UNKNOWN_HOST",
            DispatchErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            DispatchErrorCode::UpgradeFailed => "UPGRADE_FAILED",
        }
    }
}

/// Build a plain-text error response with an `X-Proxy-Error` code header.
pub fn text_error_response(
    code: DispatchErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "text/plain")
        .header("X-Proxy-Error", code.as_header_value())
        .body(
            Full::new(Bytes::from(message.into()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static headers")
}

/// Diagnostic body for a request whose host matched no configured domain.
pub fn unknown_host_message(host: &str) -> String {
    format!("Invalid request for domain \"{}\"", host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            DispatchErrorCode::MissingHostHeader.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            DispatchErrorCode::UnknownHost.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            DispatchErrorCode::ConnectionFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_text_error_response_headers() {
        let response = text_error_response(
            DispatchErrorCode::UnknownHost,
            unknown_host_message("nobody.test"),
        );
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers().get("Content-Type").unwrap(), "text/plain");
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "UNKNOWN_HOST"
        );
    }

    #[test]
    fn test_unknown_host_message_names_the_host() {
        assert!(unknown_host_message("nobody.test").contains("nobody.test"));
    }
}
