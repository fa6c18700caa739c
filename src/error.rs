//! Error types and synthesized plain-text responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};

/// Text reported when the command exits non-zero without writing to stderr
pub const NO_OUTPUT_MESSAGE: &str = "non-zero exit (but no output) from subprocess";

/// Body returned when the app never answered before the request timeout
pub const CONNECTION_REFUSED_MESSAGE: &str = "Connection Refused\n";

/// Body returned when the client's request body could not be buffered
pub const BODY_READ_FAILED_MESSAGE: &str = "Failed to read request body\n";

/// Failure of the supervised command.
///
/// The display text is exactly what the user should see in the browser: the
/// command's stderr, so build errors show up where the request was made.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunError {
    /// The command could not be started
    #[error("{0}")]
    Spawn(String),
    /// The command started and later exited with a positive status
    #[error("{message}")]
    Exit { code: i32, message: String },
}

impl RunError {
    /// Build an exit failure from captured stderr
    pub fn exit(code: i32, stderr: &[u8]) -> Self {
        RunError::Exit {
            code,
            message: message_or_placeholder(stderr),
        }
    }
}

fn message_or_placeholder(stderr: &[u8]) -> String {
    if stderr.is_empty() {
        NO_OUTPUT_MESSAGE.to_string()
    } else {
        String::from_utf8_lossy(stderr).into_owned()
    }
}

/// Reasons the proxy answers a request itself instead of relaying the app's response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorCode {
    /// The last build/run failed; the stored message is returned
    CommandFailed,
    /// The app did not accept the request before the timeout
    ConnectionRefused,
    /// The request body could not be read
    BodyReadFailed,
}

impl ProxyErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::CommandFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::ConnectionRefused => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::BodyReadFailed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Value for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::CommandFailed => "COMMAND_FAILED",
            ProxyErrorCode::ConnectionRefused => "CONNECTION_REFUSED",
            ProxyErrorCode::BodyReadFailed => "BODY_READ_FAILED",
        }
    }
}

/// Create a plain-text error response with X-Proxy-Error header
pub fn error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "text/plain; charset=utf-8")
        .header("X-Proxy-Error", code.as_header_value())
        .body(
            Full::new(Bytes::from(message.into()))
                .map_err(|e| match e {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static headers")
}
