//! Error taxonomy for the transport layer.

use thiserror::Error;

/// Why a request never produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
  /// The request or connection timed out (including our own abort timer)
  Timeout,
  /// DNS failure or the host could not be reached at all
  Unreachable,
  /// The host actively refused the connection
  Refused,
  /// The connection was reset or aborted mid-flight
  Reset,
  /// Anything else that left us without a response
  Other,
}

impl NetworkErrorKind {
  /// Message suitable for showing to the user as-is.
  pub fn user_message(self) -> &'static str {
    match self {
      Self::Timeout => "Request timed out. Please check your connection and try again.",
      Self::Unreachable => "Cannot reach the server. Please check your internet connection.",
      Self::Refused => "The server refused the connection. Please try again later.",
      Self::Reset => "The connection was interrupted. Please try again.",
      Self::Other => "Network error. Please check your connection and try again.",
    }
  }
}

/// Errors surfaced by [`Transport`](super::Transport) and carried through the cache.
///
/// Cloneable so that one in-flight result can be handed to every subscriber
/// that attached to it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
  /// No response was received.
  #[error("{message}")]
  Network {
    kind: NetworkErrorKind,
    message: String,
  },

  /// The server answered with a non-2xx status.
  #[error("{message} (status {status})")]
  Rejected { status: u16, message: String },

  /// The server answered 401.
  ///
  /// `credential_cleared` is true when a stored credential was sent, rejected,
  /// and therefore wiped from the credential store.
  #[error("{message} (status 401)")]
  Unauthorized {
    message: String,
    credential_cleared: bool,
  },

  /// A response arrived but its body did not match the expected shape.
  #[error("Failed to decode response: {0}")]
  Decode(String),

  /// The request path could not be resolved against the configured origin.
  #[error("Invalid request path: {0}")]
  InvalidPath(String),
}

impl TransportError {
  pub fn network(kind: NetworkErrorKind) -> Self {
    Self::Network {
      kind,
      message: kind.user_message().to_string(),
    }
  }

  /// HTTP status associated with the error; `0` when no response was received.
  pub fn status(&self) -> u16 {
    match self {
      Self::Rejected { status, .. } => *status,
      Self::Unauthorized { .. } => 401,
      Self::Network { .. } | Self::Decode(_) | Self::InvalidPath(_) => 0,
    }
  }

  /// Only network failures are worth retrying automatically.
  pub fn is_retryable(&self) -> bool {
    matches!(self, Self::Network { .. })
  }

  pub fn is_unauthorized(&self) -> bool {
    matches!(self, Self::Unauthorized { .. })
  }
}

impl From<serde_json::Error> for TransportError {
  fn from(e: serde_json::Error) -> Self {
    Self::Decode(e.to_string())
  }
}
