// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Tunnel channel kinds, their data frames, and the adapter that turns them into byte streams

use std::{net::SocketAddr, sync::Arc};

pub mod adapter;
pub mod frame;
pub mod mux;

pub use adapter::ChannelDataAdapter;
pub use frame::{ChannelData, ChannelDataType, ChannelMessage};
pub use mux::MuxChannel;

/// Session-scoped identifier of a multiplexed channel
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ChannelId(u32);

impl ChannelId {
  pub fn new(id: u32) -> Self {
    Self(id)
  }
}

impl std::fmt::Display for ChannelId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "#{}", self.0)
  }
}

/// Asks the peer to open a TCP connection to `target_host:target_port` on our behalf
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirectTcpIp {
  pub target_host: String,
  pub target_port: u16,
  pub originator: SocketAddr,
}

/// Announces a connection accepted on a listener registered by a prior listen request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForwardedTcpIp {
  pub listening_host: String,
  pub listening_port: u16,
  pub originator: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelType {
  DirectTcpIp(DirectTcpIp),
  ForwardedTcpIp(ForwardedTcpIp),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ChannelKind {
  DirectTcpIp,
  ForwardedTcpIp,
}

impl ChannelType {
  pub fn kind(&self) -> ChannelKind {
    match self {
      Self::DirectTcpIp(_) => ChannelKind::DirectTcpIp,
      Self::ForwardedTcpIp(_) => ChannelKind::ForwardedTcpIp,
    }
  }

  pub fn originator(&self) -> SocketAddr {
    match self {
      Self::DirectTcpIp(direct) => direct.originator,
      Self::ForwardedTcpIp(forwarded) => forwarded.originator,
    }
  }
}

impl From<DirectTcpIp> for ChannelType {
  fn from(direct: DirectTcpIp) -> Self {
    Self::DirectTcpIp(direct)
  }
}

impl From<ForwardedTcpIp> for ChannelType {
  fn from(forwarded: ForwardedTcpIp) -> Self {
    Self::ForwardedTcpIp(forwarded)
  }
}

impl std::fmt::Display for ChannelKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      Self::DirectTcpIp => "direct-tcpip",
      Self::ForwardedTcpIp => "forwarded-tcpip",
    })
  }
}

/// Failures scoped to a single channel; other channels of the session are unaffected
#[derive(thiserror::Error, Debug, Clone)]
pub enum ChannelError {
  #[error("Received a data frame of a type not permitted on this channel")]
  InvalidDataType,
  #[error("Transport does not support remote half-closure")]
  HalfClosureUnsupported,
  #[error("Channel open rejected by peer: {0}")]
  OpenRejected(Arc<String>),
  #[error("Expected a {expected} channel but the session produced {actual}")]
  UnexpectedChannelType {
    expected: ChannelKind,
    actual: ChannelKind,
  },
  #[error("Session closed")]
  SessionClosed,
  #[error("Channel closed")]
  ChannelClosed,
  #[error("Channel open timed out")]
  OpenTimedOut,
  #[error("Listener stopped before the channel was established")]
  ListenerStopped,
  #[error("Channel I/O error: {0}")]
  Io(#[source] Arc<std::io::Error>),
}

impl ChannelError {
  pub fn rejected<T: Into<String>>(reason: T) -> Self {
    Self::OpenRejected(Arc::new(reason.into()))
  }

  /// Converts into an I/O error that can be recovered with `ChannelError::from`
  pub fn into_io(self) -> std::io::Error {
    use std::io::ErrorKind;
    let kind = match &self {
      Self::InvalidDataType => ErrorKind::InvalidData,
      Self::ChannelClosed | Self::SessionClosed => ErrorKind::BrokenPipe,
      Self::OpenTimedOut => ErrorKind::TimedOut,
      Self::Io(inner) => inner.kind(),
      _ => ErrorKind::Other,
    };
    std::io::Error::new(kind, self)
  }
}

impl From<std::io::Error> for ChannelError {
  fn from(error: std::io::Error) -> Self {
    match error
      .get_ref()
      .and_then(|inner| inner.downcast_ref::<ChannelError>())
    {
      Some(channel_error) => channel_error.clone(),
      None => Self::Io(Arc::new(error)),
    }
  }
}
