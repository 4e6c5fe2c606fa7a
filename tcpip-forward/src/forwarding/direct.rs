// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::{BoxFuture, FutureExt};
use std::sync::Arc;
use tracing_futures::Instrument;

use crate::common::{
  channel::{ChannelDataAdapter, ChannelError, ChannelType, DirectTcpIp, ForwardedTcpIp},
  config::ForwardingConfig,
  error::ForwardingError,
  session::{with_open_timeout, Session},
};

/// An initializer that leaves a freshly opened tunnel channel untouched
pub fn no_preamble(_adapter: &mut ChannelDataAdapter) -> BoxFuture<'_, Result<(), ChannelError>> {
  futures::future::ready(Ok(())).boxed()
}

/// Opens tunnel channels for application use
///
/// Every channel handed out has remote half-closure enabled, is wrapped in a
/// [`ChannelDataAdapter`], and has been through the caller's initializer.
pub struct DirectTunnelFactory<S: Session> {
  session: Arc<S>,
  config: Arc<ForwardingConfig>,
}

impl<S: Session> std::fmt::Debug for DirectTunnelFactory<S> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DirectTunnelFactory")
      .field("event_loop", self.session.event_loop())
      .field("config", &self.config)
      .finish()
  }
}

impl<S: Session> DirectTunnelFactory<S> {
  pub fn new(session: Arc<S>, config: Arc<ForwardingConfig>) -> Self {
    Self { session, config }
  }

  /// Asks the peer to connect to `target` and returns the initialized channel
  pub fn create_direct_channel<I>(
    &self,
    target: DirectTcpIp,
    initializer: I,
  ) -> BoxFuture<'static, Result<ChannelDataAdapter, ForwardingError>>
  where
    I: for<'a> FnOnce(&'a mut ChannelDataAdapter) -> BoxFuture<'a, Result<(), ChannelError>>
      + Send
      + 'static,
  {
    self.create_tunnel_channel(target.into(), initializer)
  }

  /// Announces a forwarded connection to the peer and returns the initialized channel
  pub fn create_forwarded_channel<I>(
    &self,
    target: ForwardedTcpIp,
    initializer: I,
  ) -> BoxFuture<'static, Result<ChannelDataAdapter, ForwardingError>>
  where
    I: for<'a> FnOnce(&'a mut ChannelDataAdapter) -> BoxFuture<'a, Result<(), ChannelError>>
      + Send
      + 'static,
  {
    self.create_tunnel_channel(target.into(), initializer)
  }

  fn create_tunnel_channel<I>(
    &self,
    channel_type: ChannelType,
    initializer: I,
  ) -> BoxFuture<'static, Result<ChannelDataAdapter, ForwardingError>>
  where
    I: for<'a> FnOnce(&'a mut ChannelDataAdapter) -> BoxFuture<'a, Result<(), ChannelError>>
      + Send
      + 'static,
  {
    let expected = channel_type.kind();
    let span = tracing::debug_span!("tunnel_channel", kind = %expected);
    let open = self
      .session
      .create_channel(channel_type, move |channel, resolved| async move {
        if resolved.kind() != expected {
          // Dropping the channel here closes it before anyone can use it
          return Err(ChannelError::UnexpectedChannelType {
            expected,
            actual: resolved.kind(),
          });
        }
        let mut adapter = ChannelDataAdapter::attach(channel)?;
        initializer(&mut adapter).await?;
        tracing::trace!(channel = %adapter.id(), "Tunnel channel initialized");
        Ok(adapter)
      });
    let opening = self
      .session
      .event_loop()
      .submit(with_open_timeout(open, self.config.channel_open_timeout()));
    async move {
      opening.await?.map_err(|error| {
        tracing::debug!(error = %error, "Tunnel channel creation failed");
        ForwardingError::ChannelCreationFailed(error)
      })
    }
    .instrument(span)
    .boxed()
  }
}
