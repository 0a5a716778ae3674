//! Error types for the plugin security layer.
//!
//! ポリシー拒否・リソース違反・実行時フォールトは結果値として返し、
//! ここで定義する `Error` はインフラ障害と不正な入力に限定する。

use thiserror::Error;

/// Result type alias for sentinel operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for sentinel operations
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid plugin manifest
    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid configuration error
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parse error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Trust store / revocation list error
    #[error("Trust store error: {0}")]
    TrustStore(String),

    /// Signature handling error
    #[error("Signature error: {0}")]
    Signature(String),

    /// Trust escalation rejected
    #[error("Escalation rejected: {0}")]
    Escalation(String),

    /// Sandbox infrastructure error
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// Emergency response error
    #[error("Emergency error: {0}")]
    Emergency(String),

    /// Plugin is quarantined
    #[error("Plugin quarantined: {0}")]
    Quarantined(String),

    /// Entity not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// セキュリティ判定に関わるエラーかどうか
    ///
    /// 判定経路でこれらが発生した場合、呼び出し側は拒否側に倒す。
    pub fn is_security_relevant(&self) -> bool {
        matches!(
            self,
            Error::TrustStore(_)
                | Error::Signature(_)
                | Error::Escalation(_)
                | Error::Sandbox(_)
                | Error::Quarantined(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidManifest("missing name".to_string());
        assert!(err.to_string().contains("missing name"));
    }

    #[test]
    fn test_security_relevance() {
        assert!(Error::TrustStore("io".to_string()).is_security_relevant());
        assert!(!Error::InvalidInput("x".to_string()).is_security_relevant());
    }
}
