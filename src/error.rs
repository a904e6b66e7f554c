//! Error types for the ticket registry and plain-text HTTP error responses

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use thiserror::Error;

/// Errors surfaced by the registry mutators and pod-config conversion.
///
/// These are logged and reported to the caller; none of them is fatal.
#[derive(Debug, Error)]
pub enum Error {
    /// A backend with this name is already registered
    #[error("backend {0} already exists")]
    AlreadyExists(String),

    /// No backend with this name is registered
    #[error("backend {0} does not exist")]
    NotFound(String),

    /// The pod has not been assigned an IP yet
    #[error("pod {0} has no assigned IP")]
    NoIp(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Create a plain-text HTTP response - infallible with valid StatusCode
pub fn text_response(
    status: StatusCode,
    body: impl Into<Bytes>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(Full::new(body.into()).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static header")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            Error::AlreadyExists("p1".to_string()).to_string(),
            "backend p1 already exists"
        );
        assert_eq!(
            Error::NotFound("p2".to_string()).to_string(),
            "backend p2 does not exist"
        );
        assert_eq!(
            Error::NoIp("p3".to_string()).to_string(),
            "pod p3 has no assigned IP"
        );
    }

    #[test]
    fn test_text_response() {
        let response = text_response(StatusCode::FORBIDDEN, "No valid cookie!");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "text/plain; charset=utf-8"
        );
    }
}
