//! Protocol error types

use thiserror::Error;

/// Data model and document errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A VID or PID field that is not exactly four hex digits
    #[error("Invalid {field} '{value}': expected exactly 4 hex digits")]
    InvalidKeyField { field: &'static str, value: String },

    /// A textual device key that could not be parsed
    #[error("Invalid device key '{0}': expected VID:PID (e.g. '046D:C52B')")]
    InvalidKey(String),

    /// JSON syntax or schema error in a whitelist or inventory document
    #[error("Malformed document: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Inventory output that is valid JSON but neither an object nor an array
    #[error("Unexpected inventory document: expected object or array, got {0}")]
    UnexpectedInventory(String),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::InvalidKeyField {
            field: "VID",
            value: "12G4".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Invalid VID"));
        assert!(msg.contains("12G4"));
    }

    #[test]
    fn test_malformed_from_serde() {
        let serde_err = serde_json::from_str::<Vec<u8>>("[1,").unwrap_err();
        let err: ProtocolError = serde_err.into();
        assert!(format!("{}", err).starts_with("Malformed document"));
    }
}
