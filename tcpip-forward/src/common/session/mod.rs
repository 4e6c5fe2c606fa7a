// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The session contract forwarding is built on
//!
//! A session owns a channel multiplexer and is the single gateway through which
//! channels are opened. Everything touching a session runs on its [`EventLoop`].

use futures::future::{BoxFuture, Future};
use std::time::Duration;

use crate::common::{
  channel::{ChannelError, ChannelType, MuxChannel},
  event_loop::EventLoop,
};

pub mod memory;

pub trait Session: Send + Sync + 'static {
  fn event_loop(&self) -> &EventLoop;

  /// Resolves once the session has been torn down
  fn closed(&self) -> BoxFuture<'static, ()>;

  /// Opens a channel of the given type to the peer
  ///
  /// `setup` runs on the session's loop once the peer confirmed the channel,
  /// receiving the channel and the type the peer resolved it as. Its result is
  /// the result of the whole open. Dropping the returned future abandons the
  /// open and closes a channel the peer already confirmed.
  fn create_channel<T, F, Fut>(
    &self,
    channel_type: ChannelType,
    setup: F,
  ) -> BoxFuture<'static, Result<T, ChannelError>>
  where
    T: Send + 'static,
    F: FnOnce(MuxChannel, ChannelType) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, ChannelError>> + Send + 'static;
}

/// Bounds a channel open by the configured timeout, if any
pub(crate) async fn with_open_timeout<T, F>(
  open: F,
  timeout: Option<Duration>,
) -> Result<T, ChannelError>
where
  F: Future<Output = Result<T, ChannelError>>,
{
  match timeout {
    None => open.await,
    Some(limit) => match tokio::time::timeout(limit, open).await {
      Ok(result) => result,
      Err(_elapsed) => {
        tracing::debug!(timeout = ?limit, "Channel open timed out");
        Err(ChannelError::OpenTimedOut)
      }
    },
  }
}

#[cfg(test)]
mod tests {
  use super::with_open_timeout;
  use crate::common::channel::ChannelError;
  use std::time::Duration;

  #[tokio::test]
  async fn open_timeout_fails_slow_opens() {
    let slow = futures::future::pending::<Result<(), ChannelError>>();
    assert!(matches!(
      with_open_timeout(slow, Some(Duration::from_millis(20))).await,
      Err(ChannelError::OpenTimedOut)
    ));
  }

  #[tokio::test]
  async fn open_without_timeout_passes_results_through() {
    let rejected = async { Err::<(), _>(ChannelError::rejected("nope")) };
    assert!(matches!(
      with_open_timeout(rejected, None).await,
      Err(ChannelError::OpenRejected(_))
    ));
    assert_eq!(with_open_timeout(async { Ok(5) }, None).await.unwrap(), 5);
  }
}
