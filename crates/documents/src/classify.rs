//! Failure classification.
//!
//! Maps an observed worker/transport failure message to a retry category and
//! a stable error code. Rules are case-insensitive substring matches applied
//! in a fixed precedence; the first rule that matches wins.

use serde::{Deserialize, Serialize};

/// Whether a failure is worth retrying.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Transient,
    Permanent,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "TRANSIENT",
            ErrorKind::Permanent => "PERMANENT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TRANSIENT" => Some(ErrorKind::Transient),
            "PERMANENT" => Some(ErrorKind::Permanent),
            _ => None,
        }
    }
}

/// Stable error codes persisted in `last_error_code`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    WorkerError,
    Timeout,
    NetworkError,
    ClamavUnavailable,
    CorruptFile,
    UnsupportedFormat,
    FileTooLarge,
    UnknownFailure,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::WorkerError => "WORKER_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::ClamavUnavailable => "CLAMAV_UNAVAILABLE",
            ErrorCode::CorruptFile => "CORRUPT_FILE",
            ErrorCode::UnsupportedFormat => "UNSUPPORTED_FORMAT",
            ErrorCode::FileTooLarge => "FILE_TOO_LARGE",
            ErrorCode::UnknownFailure => "UNKNOWN_FAILURE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let code = match s {
            "WORKER_ERROR" => ErrorCode::WorkerError,
            "TIMEOUT" => ErrorCode::Timeout,
            "NETWORK_ERROR" => ErrorCode::NetworkError,
            "CLAMAV_UNAVAILABLE" => ErrorCode::ClamavUnavailable,
            "CORRUPT_FILE" => ErrorCode::CorruptFile,
            "UNSUPPORTED_FORMAT" => ErrorCode::UnsupportedFormat,
            "FILE_TOO_LARGE" => ErrorCode::FileTooLarge,
            "UNKNOWN_FAILURE" => ErrorCode::UnknownFailure,
            _ => return None,
        };
        Some(code)
    }
}

impl core::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying a failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub kind: ErrorKind,
    pub code: ErrorCode,
}

impl Classification {
    pub const fn transient(code: ErrorCode) -> Self {
        Self {
            kind: ErrorKind::Transient,
            code,
        }
    }

    pub const fn permanent(code: ErrorCode) -> Self {
        Self {
            kind: ErrorKind::Permanent,
            code,
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.kind == ErrorKind::Permanent
    }
}

/// Classify a failure message.
///
/// Unrecognized messages are treated as transient: a wrongly retried
/// permanent failure costs a few attempts, a wrongly dropped transient one
/// loses the document.
pub fn classify(message: &str) -> Classification {
    let msg = message.to_lowercase();
    let has = |needle: &str| msg.contains(needle);

    if has("500") || has("502") || has("503") {
        Classification::transient(ErrorCode::WorkerError)
    } else if has("timeout") || has("timed out") {
        Classification::transient(ErrorCode::Timeout)
    } else if has("connection") || has("network") {
        Classification::transient(ErrorCode::NetworkError)
    } else if has("clamav") && has("unavailable") {
        Classification::transient(ErrorCode::ClamavUnavailable)
    } else if has("corrupt") || has("invalid") {
        Classification::permanent(ErrorCode::CorruptFile)
    } else if has("unsupported") || has("format") {
        Classification::permanent(ErrorCode::UnsupportedFormat)
    } else if has("size limit") || has("too large") {
        Classification::permanent(ErrorCode::FileTooLarge)
    } else {
        Classification::transient(ErrorCode::UnknownFailure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn worker_status_codes_are_transient() {
        assert_eq!(
            classify("Worker returned status 503"),
            Classification::transient(ErrorCode::WorkerError)
        );
        assert_eq!(
            classify("Worker returned status 502: bad gateway"),
            Classification::transient(ErrorCode::WorkerError)
        );
    }

    #[test]
    fn unsupported_format_is_permanent() {
        assert_eq!(
            classify("Unsupported format: .xyz"),
            Classification::permanent(ErrorCode::UnsupportedFormat)
        );
    }

    #[test]
    fn unrecognized_message_defaults_to_transient_unknown() {
        assert_eq!(
            classify("something odd happened"),
            Classification::transient(ErrorCode::UnknownFailure)
        );
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert_eq!(classify("Request TIMED OUT").code, ErrorCode::Timeout);
        assert_eq!(classify("CORRUPT header").code, ErrorCode::CorruptFile);
    }

    #[test]
    fn precedence_puts_transport_failures_before_content_failures() {
        // "500" wins over "invalid"
        assert_eq!(
            classify("Worker returned status 500: invalid state").code,
            ErrorCode::WorkerError
        );
        // "connection" wins over "too large"
        assert_eq!(
            classify("connection reset while uploading too large body").code,
            ErrorCode::NetworkError
        );
    }

    #[test]
    fn clamav_needs_both_words() {
        assert_eq!(
            classify("ClamAV daemon unavailable").code,
            ErrorCode::ClamavUnavailable
        );
        assert_eq!(classify("clamav signature db stale").code, ErrorCode::UnknownFailure);
    }

    #[test]
    fn size_limits_are_permanent() {
        let c = classify("file exceeds size limit");
        assert_eq!(c, Classification::permanent(ErrorCode::FileTooLarge));
        assert!(c.is_permanent());
    }

    #[test]
    fn codes_parse_back_from_their_wire_names() {
        for code in [
            ErrorCode::WorkerError,
            ErrorCode::Timeout,
            ErrorCode::NetworkError,
            ErrorCode::ClamavUnavailable,
            ErrorCode::CorruptFile,
            ErrorCode::UnsupportedFormat,
            ErrorCode::FileTooLarge,
            ErrorCode::UnknownFailure,
        ] {
            assert_eq!(ErrorCode::parse(code.as_str()), Some(code));
        }
    }

    proptest! {
        /// Classification is a pure function of the lowercased message.
        #[test]
        fn classification_ignores_case(msg in "[a-zA-Z0-9 .:]{0,40}") {
            prop_assert_eq!(classify(&msg), classify(&msg.to_uppercase()));
        }

        /// Any message mentioning a 503 is a retryable worker error.
        #[test]
        fn any_503_is_worker_error(prefix in "[a-z ]{0,20}", suffix in "[a-z ]{0,20}") {
            let msg = format!("{prefix}503{suffix}");
            prop_assert_eq!(classify(&msg), Classification::transient(ErrorCode::WorkerError));
        }
    }
}
