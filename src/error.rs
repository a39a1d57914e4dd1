/// Errors surfaced by the registry library.
///
/// Protocol-level rejections of well-formed requests (no identity key,
/// failed validation, ...) are not errors; they come back as
/// [`IngestOutcome`](crate::types::IngestOutcome) values.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed advertisement: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("expression syntax error: {reason}")]
    Parse { reason: String },

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("timed out while {phase}")]
    Timeout { phase: &'static str },

    #[error("unknown command {0}")]
    UnknownCommand(u32),

    #[error("query has no Requirements expression")]
    MissingRequirements,

    #[error("query rejected: {reason}")]
    QueryRejected { reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_parse() {
        let err = CollectorError::Parse {
            reason: "unexpected end of expression".into(),
        };
        assert_eq!(
            err.to_string(),
            "expression syntax error: unexpected end of expression"
        );
    }

    #[test]
    fn test_display_message_too_large() {
        let err = CollectorError::MessageTooLarge {
            size: 5_000_000,
            max: 4_194_304,
        };
        assert_eq!(
            err.to_string(),
            "message too large: 5000000 bytes (max 4194304)"
        );
    }

    #[test]
    fn test_display_timeout() {
        let err = CollectorError::Timeout {
            phase: "reading command",
        };
        assert_eq!(err.to_string(), "timed out while reading command");
    }

    #[test]
    fn test_display_unknown_command() {
        assert_eq!(
            CollectorError::UnknownCommand(999).to_string(),
            "unknown command 999"
        );
    }

    #[test]
    fn test_io_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let err: CollectorError = io.into();
        assert!(matches!(err, CollectorError::Io(_)));
    }
}
