//! Error types for the p2p file sharing network
//!
//! This module defines the error types shared by the tracker and peer
//! components.

use std::fmt;

/// Comprehensive error type for tracker and peer operations
#[derive(Debug, Clone)]
pub enum ShareError {
    /// Network errors (connect, send, receive, bind, timeout)
    NetworkError {
        message: String,
        address: Option<String>,
        source: Option<String>,
        is_retryable: bool,
    },

    /// Control or data plane protocol errors
    ProtocolError {
        message: String,
        source: Option<String>,
    },

    /// Registry errors (unknown files, missing owners)
    RegistryError {
        message: String,
        filename: Option<String>,
    },

    /// File I/O and chunk store errors
    StorageError {
        message: String,
        path: Option<String>,
        source: Option<String>,
    },

    /// NAT traversal errors (unsupported NAT type, STUN failures)
    NatError {
        message: String,
        nat_type: Option<String>,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },
}

impl ShareError {
    /// Create a new NetworkError
    pub fn network_error(message: impl Into<String>) -> Self {
        ShareError::NetworkError {
            message: message.into(),
            address: None,
            source: None,
            is_retryable: false,
        }
    }

    /// Create a new NetworkError with address
    pub fn network_error_with_address(message: impl Into<String>, address: impl Into<String>) -> Self {
        ShareError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: None,
            is_retryable: false,
        }
    }

    /// Create a new NetworkError with address and source
    pub fn network_error_full(message: impl Into<String>, address: impl Into<String>, source: impl Into<String>) -> Self {
        ShareError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: Some(source.into()),
            is_retryable: false,
        }
    }

    /// Create a retryable NetworkError (timeouts, transient send failures)
    pub fn network_error_retryable(message: impl Into<String>, address: impl Into<String>) -> Self {
        ShareError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: None,
            is_retryable: true,
        }
    }

    /// Create a new ProtocolError
    pub fn protocol_error(message: impl Into<String>) -> Self {
        ShareError::ProtocolError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ProtocolError with source
    pub fn protocol_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        ShareError::ProtocolError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new RegistryError
    pub fn registry_error(message: impl Into<String>) -> Self {
        ShareError::RegistryError {
            message: message.into(),
            filename: None,
        }
    }

    /// Create a new RegistryError for a specific filename
    pub fn file_not_found(filename: impl Into<String>) -> Self {
        ShareError::RegistryError {
            message: "File not found".to_string(),
            filename: Some(filename.into()),
        }
    }

    /// Create a new StorageError
    pub fn storage_error(message: impl Into<String>) -> Self {
        ShareError::StorageError {
            message: message.into(),
            path: None,
            source: None,
        }
    }

    /// Create a new StorageError with path
    pub fn storage_error_with_path(message: impl Into<String>, path: impl Into<String>) -> Self {
        ShareError::StorageError {
            message: message.into(),
            path: Some(path.into()),
            source: None,
        }
    }

    /// Create a new StorageError with path and source
    pub fn storage_error_full(message: impl Into<String>, path: impl Into<String>, source: impl Into<String>) -> Self {
        ShareError::StorageError {
            message: message.into(),
            path: Some(path.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new NatError
    pub fn nat_error(message: impl Into<String>) -> Self {
        ShareError::NatError {
            message: message.into(),
            nat_type: None,
        }
    }

    /// Create an UnsupportedNatType error (fatal)
    pub fn unsupported_nat_type(nat_type: impl Into<String>) -> Self {
        ShareError::NatError {
            message: "Unsupported NAT type".to_string(),
            nat_type: Some(nat_type.into()),
        }
    }

    /// Create a new ConfigError
    pub fn config_error(message: impl Into<String>) -> Self {
        ShareError::ConfigError {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        ShareError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Whether the operation that produced this error may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, ShareError::NetworkError { is_retryable: true, .. })
    }
}

impl fmt::Display for ShareError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShareError::NetworkError { message, address, source, is_retryable } => {
                let retry = if *is_retryable { " (retryable)" } else { "" };
                match (address, source) {
                    (Some(a), Some(s)) => write!(f, "Network error{}: {} (address: {}, source: {})", retry, message, a, s),
                    (Some(a), None) => write!(f, "Network error{}: {} (address: {})", retry, message, a),
                    (None, Some(s)) => write!(f, "Network error{}: {} (source: {})", retry, message, s),
                    (None, None) => write!(f, "Network error{}: {}", retry, message),
                }
            }
            ShareError::ProtocolError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Protocol error: {} (source: {})", message, src)
                } else {
                    write!(f, "Protocol error: {}", message)
                }
            }
            ShareError::RegistryError { message, filename } => {
                if let Some(name) = filename {
                    write!(f, "Registry error: {} (filename: {})", message, name)
                } else {
                    write!(f, "Registry error: {}", message)
                }
            }
            ShareError::StorageError { message, path, source } => {
                match (path, source) {
                    (Some(p), Some(s)) => write!(f, "Storage error: {} (path: {}, source: {})", message, p, s),
                    (Some(p), None) => write!(f, "Storage error: {} (path: {})", message, p),
                    (None, Some(s)) => write!(f, "Storage error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Storage error: {}", message),
                }
            }
            ShareError::NatError { message, nat_type } => {
                if let Some(nat) = nat_type {
                    write!(f, "NAT error: {} (nat type: {})", message, nat)
                } else {
                    write!(f, "NAT error: {}", message)
                }
            }
            ShareError::ConfigError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Config error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Config error: {}", message)
                }
            }
        }
    }
}

impl std::error::Error for ShareError {}

impl From<std::io::Error> for ShareError {
    fn from(err: std::io::Error) -> Self {
        ShareError::storage_error_full(err.to_string(), "unknown".to_string(), err.kind().to_string())
    }
}

impl From<serde_json::Error> for ShareError {
    fn from(err: serde_json::Error) -> Self {
        ShareError::protocol_error_with_source("Failed to parse JSON message", err.to_string())
    }
}

impl From<std::net::AddrParseError> for ShareError {
    fn from(err: std::net::AddrParseError) -> Self {
        ShareError::network_error_full("Failed to parse address", "unknown".to_string(), err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ShareError {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        ShareError::NetworkError {
            message: "Operation timed out".to_string(),
            address: None,
            source: None,
            is_retryable: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_error() {
        let err = ShareError::network_error("Connection refused");
        assert_eq!(err.to_string(), "Network error: Connection refused");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_network_error_retryable() {
        let err = ShareError::network_error_retryable("Request timed out", "127.0.0.1:7000");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("retryable"));
        assert!(err.to_string().contains("127.0.0.1:7000"));
    }

    #[test]
    fn test_file_not_found() {
        let err = ShareError::file_not_found("missing.txt");
        assert!(err.to_string().contains("Registry error"));
        assert!(err.to_string().contains("missing.txt"));
    }

    #[test]
    fn test_unsupported_nat_type() {
        let err = ShareError::unsupported_nat_type("Symmetric NAT");
        assert!(err.to_string().contains("NAT error"));
        assert!(err.to_string().contains("Symmetric NAT"));
    }

    #[test]
    fn test_storage_error_with_path() {
        let err = ShareError::storage_error_with_path("Chunk file missing", "/share/doc.txt.2.chunk");
        assert!(err.to_string().contains("Storage error"));
        assert!(err.to_string().contains("/share/doc.txt.2.chunk"));
    }

    #[test]
    fn test_config_error_with_field() {
        let err = ShareError::config_error_with_field("Port cannot be 0", "port");
        assert!(err.to_string().contains("Config error"));
        assert!(err.to_string().contains("port"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let err: ShareError = io_err.into();
        assert!(matches!(err, ShareError::StorageError { .. }));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: ShareError = json_err.into();
        assert!(matches!(err, ShareError::ProtocolError { .. }));
    }

    #[test]
    fn test_from_addr_parse_error() {
        let addr_err = "invalid:address".parse::<std::net::SocketAddr>().unwrap_err();
        let err: ShareError = addr_err.into();
        assert!(matches!(err, ShareError::NetworkError { .. }));
    }
}
