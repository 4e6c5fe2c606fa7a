// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! An in-process session pair whose channels are backed by memory queues
//!
//! Channels opened on one session arrive on the opposite session's incoming
//! stream, where they can be confirmed or refused.

use futures::{
  future::{BoxFuture, Future, FutureExt},
  stream::Stream,
};
use std::sync::{
  atomic::{AtomicBool, AtomicU32, Ordering},
  Arc,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use super::Session;
use crate::common::{
  channel::{ChannelError, ChannelId, ChannelType, MuxChannel},
  config::ForwardingConfig,
  event_loop::EventLoop,
};

type OpenReply = Result<(MuxChannel, ChannelType), ChannelError>;

struct OpenRequest {
  id: ChannelId,
  channel_type: ChannelType,
  reply: oneshot::Sender<OpenReply>,
}

struct SharedState {
  next_channel_id: AtomicU32,
  half_closure_supported: AtomicBool,
  buffer_frames: usize,
  closed: CancellationToken,
}

pub struct MemorySession {
  event_loop: EventLoop,
  shared: Arc<SharedState>,
  to_peer: mpsc::UnboundedSender<OpenRequest>,
  incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<OpenRequest>>,
}

/// Two entangled sessions; each opens channels towards the other
pub struct EntangledSessions {
  pub client: MemorySession,
  pub server: MemorySession,
}

impl From<EntangledSessions> for (MemorySession, MemorySession) {
  fn from(sessions: EntangledSessions) -> Self {
    (sessions.client, sessions.server)
  }
}

pub fn pair(
  config: &ForwardingConfig,
  client_loop: EventLoop,
  server_loop: EventLoop,
) -> EntangledSessions {
  let shared = Arc::new(SharedState {
    next_channel_id: AtomicU32::new(0),
    half_closure_supported: AtomicBool::new(true),
    buffer_frames: config.channel_buffer_frames,
    closed: CancellationToken::new(),
  });
  let (client_up, server_down) = mpsc::unbounded_channel();
  let (server_up, client_down) = mpsc::unbounded_channel();
  EntangledSessions {
    client: MemorySession {
      event_loop: client_loop,
      shared: shared.clone(),
      to_peer: client_up,
      incoming: tokio::sync::Mutex::new(client_down),
    },
    server: MemorySession {
      event_loop: server_loop,
      shared,
      to_peer: server_up,
      incoming: tokio::sync::Mutex::new(server_down),
    },
  }
}

impl MemorySession {
  /// Waits for the peer's next channel open request
  ///
  /// Returns `None` once the session pair is closed.
  pub async fn next_incoming(&self) -> Option<IncomingChannel> {
    let mut incoming = self.incoming.lock().await;
    let request = tokio::select! {
      biased;
      _ = self.shared.closed.cancelled() => return None,
      request = incoming.recv() => request?,
    };
    Some(IncomingChannel {
      request,
      shared: self.shared.clone(),
    })
  }

  pub fn incoming(&self) -> impl Stream<Item = IncomingChannel> + '_ {
    futures::stream::unfold(self, |session| async move {
      session
        .next_incoming()
        .await
        .map(|incoming| (incoming, session))
    })
  }

  /// Toggles the transport's support for remote half-closure on new channels
  pub fn set_half_closure_supported(&self, supported: bool) {
    self
      .shared
      .half_closure_supported
      .store(supported, Ordering::SeqCst);
  }

  /// Closes both sessions of the pair; pending opens fail with [`ChannelError::SessionClosed`]
  pub fn close(&self) {
    if !self.shared.closed.is_cancelled() {
      tracing::debug!("Closing memory session");
      self.shared.closed.cancel();
    }
  }

  pub fn is_closed(&self) -> bool {
    self.shared.closed.is_cancelled()
  }
}

impl Drop for MemorySession {
  fn drop(&mut self) {
    self.close();
  }
}

impl Session for MemorySession {
  fn event_loop(&self) -> &EventLoop {
    &self.event_loop
  }

  fn closed(&self) -> BoxFuture<'static, ()> {
    let closed = self.shared.closed.clone();
    async move { closed.cancelled().await }.boxed()
  }

  fn create_channel<T, F, Fut>(
    &self,
    channel_type: ChannelType,
    setup: F,
  ) -> BoxFuture<'static, Result<T, ChannelError>>
  where
    T: Send + 'static,
    F: FnOnce(MuxChannel, ChannelType) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, ChannelError>> + Send + 'static,
  {
    let shared = self.shared.clone();
    let to_peer = self.to_peer.clone();
    let id = ChannelId::new(shared.next_channel_id.fetch_add(1, Ordering::Relaxed));
    let span = tracing::debug_span!("open_channel", channel = %id, kind = %channel_type.kind());
    let open = async move {
      if shared.closed.is_cancelled() {
        return Err(ChannelError::SessionClosed);
      }
      let (reply, confirmation) = oneshot::channel();
      to_peer
        .send(OpenRequest {
          id,
          channel_type,
          reply,
        })
        .map_err(|_| ChannelError::SessionClosed)?;
      let confirmed = tokio::select! {
        confirmed = confirmation => confirmed,
        _ = shared.closed.cancelled() => return Err(ChannelError::SessionClosed),
      };
      let (channel, resolved) = match confirmed {
        Ok(result) => result?,
        Err(_abandoned) if shared.closed.is_cancelled() => {
          return Err(ChannelError::SessionClosed)
        }
        Err(_abandoned) => return Err(ChannelError::rejected("Open request abandoned by peer")),
      };
      tracing::trace!(resolved = %resolved.kind(), "Channel confirmed by peer");
      setup(channel, resolved).await
    }
    .instrument(span);
    let submitted = self.event_loop.submit(open);
    async move { submitted.await.map_err(|_shutdown| ChannelError::SessionClosed)? }.boxed()
  }
}

/// A channel open request from the peer, awaiting confirmation
pub struct IncomingChannel {
  request: OpenRequest,
  shared: Arc<SharedState>,
}

impl std::fmt::Debug for IncomingChannel {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("IncomingChannel")
      .field("id", &self.request.id)
      .field("channel_type", &self.request.channel_type)
      .finish_non_exhaustive()
  }
}

impl IncomingChannel {
  pub fn id(&self) -> ChannelId {
    self.request.id
  }

  pub fn channel_type(&self) -> &ChannelType {
    &self.request.channel_type
  }

  /// Confirms the channel as requested and returns this side's end of it
  pub fn accept(self) -> Result<MuxChannel, ChannelError> {
    let requested = self.request.channel_type.clone();
    self.accept_as(requested)
  }

  /// Confirms the channel, reporting `resolved` as its type to the opener
  pub fn accept_as(self, resolved: ChannelType) -> Result<MuxChannel, ChannelError> {
    let OpenRequest { id, reply, .. } = self.request;
    let (ours, theirs) = MuxChannel::pair(
      id,
      resolved.clone(),
      self.shared.buffer_frames,
      self.shared.half_closure_supported.load(Ordering::SeqCst),
    );
    reply.send(Ok((theirs, resolved))).map_err(|_| {
      tracing::debug!(channel = %id, "Opener abandoned the channel before confirmation");
      ChannelError::ChannelClosed
    })?;
    Ok(ours)
  }

  pub fn reject<R: Into<String>>(self, reason: R) {
    let reason = reason.into();
    tracing::debug!(channel = %self.request.id, reason = %reason, "Rejecting channel open");
    let _ = self.request.reply.send(Err(ChannelError::rejected(reason)));
  }
}

#[cfg(test)]
mod tests {
  use super::{pair, EntangledSessions, MemorySession};
  use crate::{
    common::{
      channel::{
        ChannelData, ChannelDataAdapter, ChannelError, ChannelKind, ChannelMessage, ChannelType,
        DirectTcpIp, ForwardedTcpIp, MuxChannel,
      },
      config::ForwardingConfig,
      event_loop::EventLoop,
      session::Session,
    },
    test_util::TEST_TIMEOUT,
  };
  use futures::{future::BoxFuture, StreamExt};
  use tokio::time::timeout;

  fn sessions() -> (MemorySession, MemorySession) {
    let event_loop = EventLoop::current().unwrap();
    pair(&ForwardingConfig::default(), event_loop.clone(), event_loop).into()
  }

  fn direct_type() -> ChannelType {
    DirectTcpIp {
      target_host: "db.internal".into(),
      target_port: 5432,
      originator: "127.0.0.1:45000".parse().unwrap(),
    }
    .into()
  }

  fn open_raw(
    session: &MemorySession,
    channel_type: ChannelType,
  ) -> BoxFuture<'static, Result<(MuxChannel, ChannelType), ChannelError>> {
    session.create_channel(channel_type, |channel, resolved| async move {
      Ok::<_, ChannelError>((channel, resolved))
    })
  }

  #[tokio::test]
  async fn accepted_channels_carry_frames_both_ways() {
    let (client, server) = sessions();
    let opening = open_raw(&client, direct_type());
    let incoming = timeout(TEST_TIMEOUT, server.next_incoming())
      .await
      .unwrap()
      .unwrap();
    assert_eq!(incoming.channel_type(), &direct_type());
    let mut server_end = incoming.accept().unwrap();
    let (mut client_end, resolved) = timeout(TEST_TIMEOUT, opening).await.unwrap().unwrap();
    assert_eq!(resolved, direct_type());
    assert_eq!(client_end.id(), server_end.id());

    client_end
      .send(ChannelMessage::Data(ChannelData::channel(&b"query"[..])))
      .await
      .unwrap();
    assert_eq!(
      server_end.recv().await,
      Some(ChannelMessage::Data(ChannelData::channel(&b"query"[..])))
    );
    server_end
      .send(ChannelMessage::Data(ChannelData::channel(&b"rows"[..])))
      .await
      .unwrap();
    assert_eq!(
      client_end.recv().await,
      Some(ChannelMessage::Data(ChannelData::channel(&b"rows"[..])))
    );
  }

  #[tokio::test]
  async fn rejected_opens_fail() {
    let (client, server) = sessions();
    let opening = open_raw(&client, direct_type());
    server.next_incoming().await.unwrap().reject("administratively prohibited");
    match timeout(TEST_TIMEOUT, opening).await.unwrap() {
      Err(ChannelError::OpenRejected(reason)) => {
        assert_eq!(reason.as_str(), "administratively prohibited")
      }
      other => panic!("Expected a rejection, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn accept_as_reports_the_resolved_type() {
    let (client, server) = sessions();
    let opening = open_raw(&client, direct_type());
    let forwarded: ChannelType = ForwardedTcpIp {
      listening_host: "0.0.0.0".into(),
      listening_port: 8022,
      originator: "127.0.0.1:45001".parse().unwrap(),
    }
    .into();
    let _server_end = server
      .next_incoming()
      .await
      .unwrap()
      .accept_as(forwarded)
      .unwrap();
    let (_client_end, resolved) = timeout(TEST_TIMEOUT, opening).await.unwrap().unwrap();
    assert_eq!(resolved.kind(), ChannelKind::ForwardedTcpIp);
  }

  #[tokio::test]
  async fn closing_fails_pending_opens_and_ends_incoming() {
    let (client, server) = sessions();
    let client_closed = client.closed();
    let opening = open_raw(&client, direct_type());
    // Let the request reach the peer before closing
    tokio::task::yield_now().await;
    server.close();
    timeout(TEST_TIMEOUT, client_closed).await.unwrap();
    assert!(matches!(
      timeout(TEST_TIMEOUT, opening).await.unwrap(),
      Err(ChannelError::SessionClosed)
    ));
    assert!(client.is_closed());
    assert_eq!(server.incoming().count().await, 0);
    assert!(matches!(
      open_raw(&client, direct_type()).await,
      Err(ChannelError::SessionClosed)
    ));
  }

  #[tokio::test]
  async fn transport_without_half_closure_refuses_adapters() {
    let EntangledSessions { client, server } = {
      let event_loop = EventLoop::current().unwrap();
      pair(&ForwardingConfig::default(), event_loop.clone(), event_loop)
    };
    server.set_half_closure_supported(false);
    let opening = client.create_channel(direct_type(), |channel, _resolved| async move {
      ChannelDataAdapter::attach(channel)
    });
    let mut server_end = server.next_incoming().await.unwrap().accept().unwrap();
    assert!(matches!(
      timeout(TEST_TIMEOUT, opening).await.unwrap(),
      Err(ChannelError::HalfClosureUnsupported)
    ));
    assert_eq!(server_end.recv().await, None);
  }
}
