use thiserror::Error;

/// Why a single request did not produce a sample.
///
/// Every failed request carries exactly one of these. Classification happens
/// once, at the transport boundary, so the executor and the stats accumulator
/// only ever match on this enum.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    #[error("ConnectTimeout (DNS/TCP/TLS handshake)")]
    ConnectTimeout,

    #[error("WriteTimeout (likely while sending the request body)")]
    WriteTimeout,

    #[error("PoolTimeout (no available connection in pool)")]
    PoolExhausted,

    #[error("TimeoutError (overall request timeout exceeded)")]
    OverallTimeout,

    #[error("HTTPStatusError (status code: {status}, mes: {message})")]
    NonSuccessStatus { status: u16, message: String },

    #[error("Request cancelled by user")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl FailureKind {
    /// Transport or deadline expiry of any phase.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            FailureKind::ConnectTimeout
                | FailureKind::WriteTimeout
                | FailureKind::PoolExhausted
                | FailureKind::OverallTimeout
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, FailureKind::Cancelled)
    }

    /// One-line message echoed in verbose mode.
    pub fn describe(&self) -> String {
        match self {
            FailureKind::Other(message) => message.clone(),
            other => format!("Request failed: {}", other),
        }
    }

    /// Classifies an error raised while sending the request and waiting for
    /// the response head.
    ///
    /// Only expired deadlines are timeouts. A refused connection or a reset
    /// socket fails fast and is reported as a plain failure.
    pub fn from_send_error(e: &reqwest::Error) -> Self {
        send_failure(e.is_connect(), e.is_timeout(), || {
            format!("Request failed: {}", e)
        })
    }

    /// Classifies an error raised while reading the streamed body.
    pub fn from_read_error(e: &reqwest::Error) -> Self {
        FailureKind::Other(format!("Request failed: {}", e))
    }

    /// Builds the non-success failure from the status and the raw error body.
    ///
    /// OpenAI-compatible servers answer with `{"error": {"message": "..."}}`;
    /// anything else falls back to a generic message.
    pub fn from_status(status: u16, body: &[u8]) -> Self {
        let message = serde_json::from_slice::<serde_json::Value>(body)
            .ok()
            .and_then(|v| {
                v.get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "Failed to get error message".to_string());

        FailureKind::NonSuccessStatus { status, message }
    }
}

fn send_failure(connect: bool, timed_out: bool, message: impl FnOnce() -> String) -> FailureKind {
    match (connect, timed_out) {
        (true, true) => FailureKind::ConnectTimeout,
        (false, true) => FailureKind::WriteTimeout,
        _ => FailureKind::Other(message()),
    }
}
