//! RPC error types.

use mixsim_types::Amount;
use thiserror::Error;

/// Errors returned by the ledger, coordinator and wallet clients.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// No answer within the per-call timeout, after every attempt.
    #[error("{0} timed out")]
    Timeout(String),

    /// The remote answered with a JSON-RPC error object.
    #[error("{method} failed: {message}")]
    Remote { method: String, message: String },

    #[error("Invalid response to {method}: {reason}")]
    InvalidResponse { method: String, reason: String },

    /// Unspent outputs do not cover the payment total.
    #[error("Not enough BTC: need more than {needed}, have {available}")]
    InsufficientFunds { needed: Amount, available: Amount },

    /// The wallet version has no such operation.
    #[error("{0} is not supported by this wallet version")]
    Unsupported(&'static str),
}

impl RpcError {
    pub fn is_timeout(&self) -> bool {
        match self {
            RpcError::Timeout(_) => true,
            RpcError::Http(e) => e.is_timeout(),
            _ => false,
        }
    }

    pub(crate) fn invalid(method: &str, reason: impl Into<String>) -> Self {
        RpcError::InvalidResponse {
            method: method.to_string(),
            reason: reason.into(),
        }
    }
}
