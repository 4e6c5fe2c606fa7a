// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use bytes::Bytes;
use std::{
  io::Error as IOError,
  pin::Pin,
  task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::{
  ChannelData, ChannelDataType, ChannelError, ChannelId, ChannelMessage, ChannelType, MuxChannel,
};
use crate::util::cancellation::CancellationListener;

/// Largest payload carried by a single outbound data frame
pub const MAX_FRAME_PAYLOAD: usize = 1024 * 32;

#[derive(Debug, Clone)]
enum ReadState {
  Open,
  Eof,
  Failed(ChannelError),
}

#[derive(Debug, Clone)]
enum WriteState {
  Open,
  ShutDown,
  PeerClosed,
  Failed(ChannelError),
}

/// Byte-stream view of a tunnel channel
///
/// Normal data frames are unwrapped into raw bytes and outgoing bytes are
/// wrapped as normal data frames. Tunnel channels never carry extended data;
/// receiving it fails this channel with [`ChannelError::InvalidDataType`],
/// closes it towards the peer, and makes every later read or write fail.
pub struct ChannelDataAdapter {
  channel: MuxChannel,
  pending: Bytes,
  read_state: ReadState,
  write_state: WriteState,
}

impl std::fmt::Debug for ChannelDataAdapter {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ChannelDataAdapter")
      .field("channel", &self.channel)
      .field("read_state", &self.read_state)
      .field("write_state", &self.write_state)
      .finish_non_exhaustive()
  }
}

impl ChannelDataAdapter {
  /// Enables remote half-closure on the channel and takes over its data frames
  ///
  /// Fails, closing the channel, if the transport cannot grant half-closure.
  pub fn attach(mut channel: MuxChannel) -> Result<Self, ChannelError> {
    if let Err(error) = channel.set_allow_remote_half_closure(true) {
      tracing::debug!(channel = %channel.id(), error = %error, "Failed to attach channel data adapter");
      channel.close();
      return Err(error);
    }
    Ok(Self {
      channel,
      pending: Bytes::new(),
      read_state: ReadState::Open,
      write_state: WriteState::Open,
    })
  }

  pub fn id(&self) -> ChannelId {
    self.channel.id()
  }

  pub fn channel_type(&self) -> &ChannelType {
    self.channel.channel_type()
  }

  /// Fires once the peer fully closed the channel, not when it only sent EOF
  pub fn peer_closure(&self) -> CancellationListener {
    self.channel.peer_closure()
  }

  /// The error this channel was failed with, if any
  pub fn failure(&self) -> Option<&ChannelError> {
    match &self.read_state {
      ReadState::Failed(error) => Some(error),
      _ => None,
    }
  }

  fn fail(&mut self, error: ChannelError) {
    tracing::warn!(channel = %self.channel.id(), error = %error, "Tearing down tunnel channel");
    // The peer observes the dropped queues as a close
    self.channel.close();
    self.pending = Bytes::new();
    self.read_state = ReadState::Failed(error.clone());
    self.write_state = WriteState::Failed(error);
  }
}

impl AsyncRead for ChannelDataAdapter {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<Result<(), IOError>> {
    let this = self.get_mut();
    loop {
      match &this.read_state {
        ReadState::Failed(error) => return Poll::Ready(Err(error.clone().into_io())),
        ReadState::Eof if this.pending.is_empty() => return Poll::Ready(Ok(())),
        _ => (),
      }
      if !this.pending.is_empty() {
        let count = buf.remaining().min(this.pending.len());
        buf.put_slice(&this.pending.split_to(count));
        return Poll::Ready(Ok(()));
      }
      match futures::ready!(this.channel.poll_recv(cx)) {
        Some(ChannelMessage::Data(ChannelData { data_type, data })) => match data_type {
          ChannelDataType::Channel => this.pending = data,
          ChannelDataType::Extended(code) => {
            tracing::debug!(channel = %this.channel.id(), code, "Extended data received on tunnel channel");
            this.fail(ChannelError::InvalidDataType);
          }
        },
        Some(ChannelMessage::Eof) => {
          tracing::trace!(channel = %this.channel.id(), "Remote half-closed channel");
          this.read_state = ReadState::Eof;
          if this.channel.is_write_closed() {
            this.write_state = WriteState::PeerClosed;
          }
        }
        Some(ChannelMessage::Close) | None => {
          tracing::trace!(channel = %this.channel.id(), "Remote closed channel");
          this.read_state = ReadState::Eof;
          if matches!(this.write_state, WriteState::Open) {
            this.write_state = WriteState::PeerClosed;
          }
        }
      }
    }
  }
}

impl AsyncWrite for ChannelDataAdapter {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, IOError>> {
    let this = self.get_mut();
    match &this.write_state {
      WriteState::Open => (),
      WriteState::Failed(error) => return Poll::Ready(Err(error.clone().into_io())),
      WriteState::ShutDown | WriteState::PeerClosed => {
        return Poll::Ready(Err(ChannelError::ChannelClosed.into_io()))
      }
    }
    if buf.is_empty() {
      return Poll::Ready(Ok(0));
    }
    if let Err(error) = futures::ready!(this.channel.poll_ready_send(cx)) {
      this.write_state = WriteState::PeerClosed;
      return Poll::Ready(Err(error.into_io()));
    }
    let count = buf.len().min(MAX_FRAME_PAYLOAD);
    let frame = ChannelData::channel(Bytes::copy_from_slice(&buf[..count]));
    this
      .channel
      .start_send(ChannelMessage::Data(frame))
      .map_err(ChannelError::into_io)?;
    Poll::Ready(Ok(count))
  }

  fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    // Frames are handed to the transport queue as soon as they are written
    match &self.write_state {
      WriteState::Failed(error) => Poll::Ready(Err(error.clone().into_io())),
      _ => Poll::Ready(Ok(())),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    let this = self.get_mut();
    match &this.write_state {
      WriteState::Open => (),
      WriteState::Failed(error) => return Poll::Ready(Err(error.clone().into_io())),
      WriteState::ShutDown | WriteState::PeerClosed => return Poll::Ready(Ok(())),
    }
    match futures::ready!(this.channel.poll_ready_send(cx))
      .and_then(|()| this.channel.start_send(ChannelMessage::Eof))
    {
      Ok(()) => {
        tracing::trace!(channel = %this.channel.id(), "Half-closed channel");
        this.write_state = WriteState::ShutDown;
      }
      Err(_closed) => {
        // Nobody left to notify
        this.write_state = WriteState::PeerClosed;
      }
    }
    Poll::Ready(Ok(()))
  }
}
