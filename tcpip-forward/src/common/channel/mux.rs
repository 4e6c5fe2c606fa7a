// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::poll_fn;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, PollSender};

use super::{ChannelError, ChannelId, ChannelMessage, ChannelType};
use crate::util::{cancellation::CancellationListener, dropkick::Dropkick};

/// Frame-level handle to one multiplexed channel of a session
///
/// Dropping the handle releases the channel; the peer observes this as a close
/// once it has drained the frames already queued, and through
/// [`MuxChannel::peer_closure`] immediately.
pub struct MuxChannel {
  id: ChannelId,
  channel_type: ChannelType,
  outbound: PollSender<ChannelMessage>,
  inbound: mpsc::Receiver<ChannelMessage>,
  half_closure_supported: bool,
  allow_remote_half_closure: bool,
  eof_sent: bool,
  read_closed: bool,
  closed: Dropkick<CancellationToken>,
  peer_closed: CancellationListener,
}

impl std::fmt::Debug for MuxChannel {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MuxChannel")
      .field("id", &self.id)
      .field("type", &self.channel_type.kind())
      .field("eof_sent", &self.eof_sent)
      .field("read_closed", &self.read_closed)
      .finish_non_exhaustive()
  }
}

impl MuxChannel {
  /// Two entangled channel ends; frames sent on either are received by the other
  pub fn pair(
    id: ChannelId,
    channel_type: ChannelType,
    buffer_frames: usize,
    half_closure_supported: bool,
  ) -> (MuxChannel, MuxChannel) {
    let buffer_frames = buffer_frames.max(1);
    let (left_up, right_down) = mpsc::channel(buffer_frames);
    let (right_up, left_down) = mpsc::channel(buffer_frames);
    let (left_closed, right_closed) = (CancellationToken::new(), CancellationToken::new());
    (
      Self::from_parts(
        id,
        channel_type.clone(),
        (left_up, left_down),
        half_closure_supported,
        left_closed.clone(),
        CancellationListener::from(&right_closed),
      ),
      Self::from_parts(
        id,
        channel_type,
        (right_up, right_down),
        half_closure_supported,
        right_closed,
        CancellationListener::from(left_closed),
      ),
    )
  }

  /// Wraps the frame queues of a transport-provided channel
  ///
  /// `closed` is cancelled when this end closes or is dropped; `peer_closed`
  /// must observe the same signal from the far end.
  pub fn from_parts(
    id: ChannelId,
    channel_type: ChannelType,
    (outbound, inbound): (mpsc::Sender<ChannelMessage>, mpsc::Receiver<ChannelMessage>),
    half_closure_supported: bool,
    closed: CancellationToken,
    peer_closed: CancellationListener,
  ) -> Self {
    Self {
      id,
      channel_type,
      outbound: PollSender::new(outbound),
      inbound,
      half_closure_supported,
      allow_remote_half_closure: false,
      eof_sent: false,
      read_closed: false,
      closed: Dropkick::new(closed),
      peer_closed,
    }
  }

  pub fn id(&self) -> ChannelId {
    self.id
  }

  pub fn channel_type(&self) -> &ChannelType {
    &self.channel_type
  }

  /// Lets the peer end its sending direction without closing the channel
  ///
  /// When not allowed, a remote EOF closes the channel in both directions.
  pub fn set_allow_remote_half_closure(&mut self, allow: bool) -> Result<(), ChannelError> {
    if allow && !self.half_closure_supported {
      return Err(ChannelError::HalfClosureUnsupported);
    }
    self.allow_remote_half_closure = allow;
    Ok(())
  }

  pub fn allows_remote_half_closure(&self) -> bool {
    self.allow_remote_half_closure
  }

  /// Whether this end can no longer send data frames
  pub fn is_write_closed(&self) -> bool {
    self.eof_sent || self.outbound.is_closed()
  }

  /// Fires once the far end has closed or dropped its handle
  ///
  /// Unlike a `Close` frame this does not wait behind queued data.
  pub fn peer_closure(&self) -> CancellationListener {
    self.peer_closed.clone()
  }

  pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<ChannelMessage>> {
    if self.read_closed {
      return Poll::Ready(None);
    }
    let message = futures::ready!(self.inbound.poll_recv(cx));
    match &message {
      Some(ChannelMessage::Eof) if !self.allow_remote_half_closure => {
        tracing::trace!(channel = %self.id, "Remote EOF without half-closure; closing channel");
        self.close();
      }
      Some(ChannelMessage::Close) | None => {
        self.read_closed = true;
        self.outbound.close();
      }
      Some(_) => (),
    }
    Poll::Ready(message)
  }

  pub async fn recv(&mut self) -> Option<ChannelMessage> {
    poll_fn(|cx| self.poll_recv(cx)).await
  }

  /// Reserves queue capacity for the next [`MuxChannel::start_send`]
  pub fn poll_ready_send(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), ChannelError>> {
    self
      .outbound
      .poll_reserve(cx)
      .map_err(|_| ChannelError::ChannelClosed)
  }

  pub fn start_send(&mut self, message: ChannelMessage) -> Result<(), ChannelError> {
    match &message {
      ChannelMessage::Data(_) if self.eof_sent => {
        self.outbound.abort_send();
        return Err(ChannelError::ChannelClosed);
      }
      ChannelMessage::Eof if self.eof_sent => {
        self.outbound.abort_send();
        return Ok(());
      }
      _ => (),
    }
    let closing = matches!(message, ChannelMessage::Close);
    let eof = matches!(message, ChannelMessage::Eof);
    self
      .outbound
      .send_item(message)
      .map_err(|_| ChannelError::ChannelClosed)?;
    if eof {
      self.eof_sent = true;
    }
    if closing {
      self.close();
    }
    Ok(())
  }

  pub async fn send(&mut self, message: ChannelMessage) -> Result<(), ChannelError> {
    poll_fn(|cx| self.poll_ready_send(cx)).await?;
    self.start_send(message)
  }

  /// Releases the channel in both directions without waiting for the peer
  pub fn close(&mut self) {
    self.outbound.close();
    self.inbound.close();
    self.read_closed = true;
    if let Some(closed) = self.closed.get() {
      closed.cancel();
    }
  }
}
