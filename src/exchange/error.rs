use thiserror::Error;

/// Errors surfaced by the exchange layer
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Structured `{"code", "msg"}` rejection from the API
    #[error("binance api error {code} (http {status}): {msg}")]
    Api { status: u16, code: i64, msg: String },

    #[error("http {status}: {body}")]
    Http { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    /// Field present but not parseable
    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("credentials: {0}")]
    Credentials(String),

    #[error("symbol {0} not found in exchange info")]
    UnknownSymbol(String),

    /// Order refused before reaching the exchange
    #[error("order rejected: {0}")]
    Rejected(String),
}

impl ExchangeError {
    /// Whether a retry might succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ExchangeError::Api { status, code, .. } => {
                is_retryable_status(*status) || *code == -1001 || *code == -1007
            }
            ExchangeError::Http { status, .. } => is_retryable_status(*status),
            ExchangeError::Transport(err) => err.is_timeout() || err.is_connect(),
            _ => false,
        }
    }

    /// API error code, when the exchange returned one
    pub fn api_code(&self) -> Option<i64> {
        match self {
            ExchangeError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// 408, 429 and 5xx are worth retrying
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        let rate_limited = ExchangeError::Http { status: 429, body: String::new() };
        assert!(rate_limited.is_retryable());

        let margin = ExchangeError::Api {
            status: 400,
            code: -2019,
            msg: "Margin is insufficient.".into(),
        };
        assert!(!margin.is_retryable());
        assert_eq!(margin.api_code(), Some(-2019));

        let timeout = ExchangeError::Api {
            status: 408,
            code: -1007,
            msg: "Timeout waiting for response from backend server.".into(),
        };
        assert!(timeout.is_retryable());

        assert!(!ExchangeError::Rejected("qty below min".into()).is_retryable());
    }

    #[test]
    fn test_every_5xx_is_retryable() {
        for status in [500u16, 501, 505, 520, 599] {
            assert!(is_retryable_status(status), "{}", status);
        }
        for status in [400u16, 401, 404, 418, 600] {
            assert!(!is_retryable_status(status), "{}", status);
        }
    }
}
