// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use crate::common::channel::ChannelError;

/// Failures surfaced to callers of listen/cancel requests and tunnel channel creation
#[derive(thiserror::Error, Debug)]
pub enum ForwardingError {
  #[error("A forwarding listener is already active for this session")]
  AlreadyListening,
  #[error("No forwarding listener is active for this session")]
  NotListening,
  #[error("Channel creation failed: {0}")]
  ChannelCreationFailed(#[source] ChannelError),
  #[error("Received a data frame of a type not permitted on a tunnel channel")]
  InvalidDataType,
  #[error("Failed to bind forwarding listener on {addr}")]
  BindFailure {
    addr: String,
    #[source]
    source: std::io::Error,
  },
  #[error("Forwarding listener stopped")]
  ListenerStopped,
  #[error("Session closed")]
  SessionClosed,
  #[error("Event loop shut down before the operation completed")]
  EventLoopShutdown,
}

impl ForwardingError {
  /// Returns `true` if the error is [`AlreadyListening`].
  ///
  /// [`AlreadyListening`]: ForwardingError::AlreadyListening
  #[must_use]
  pub fn is_already_listening(&self) -> bool {
    matches!(self, Self::AlreadyListening)
  }

  /// Returns `true` if the error is [`NotListening`].
  ///
  /// [`NotListening`]: ForwardingError::NotListening
  #[must_use]
  pub fn is_not_listening(&self) -> bool {
    matches!(self, Self::NotListening)
  }

  /// The channel-level cause, if channel creation failed
  pub fn channel_error(&self) -> Option<&ChannelError> {
    match self {
      Self::ChannelCreationFailed(inner) => Some(inner),
      _ => None,
    }
  }
}

impl From<ChannelError> for ForwardingError {
  fn from(error: ChannelError) -> Self {
    match error {
      ChannelError::InvalidDataType => Self::InvalidDataType,
      ChannelError::ListenerStopped => Self::ListenerStopped,
      ChannelError::SessionClosed => Self::SessionClosed,
      other => Self::ChannelCreationFailed(other),
    }
  }
}
