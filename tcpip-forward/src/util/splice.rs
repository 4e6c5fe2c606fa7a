// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Bidirectional byte relay between two streams that become available independently
//!
//! A [`Splice`] starts out `Pending` and only becomes `Active` once both of its
//! endpoints have been bound to a stream. Dropping an endpoint before binding
//! it abandons the splice and releases whatever the other side had bound.

use std::sync::Arc;
use tokio::{
  io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
  sync::{oneshot, watch},
};

use super::{cancellation::CancellationListener, tunnel_stream::WrappedStream};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SpliceStatus {
  Pending { local_ready: bool, remote_ready: bool },
  Active,
  Closed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SpliceSide {
  Local,
  Remote,
}

#[derive(thiserror::Error, Debug)]
pub enum SpliceError {
  #[error("Splice endpoint dropped before it was bound")]
  Abandoned,
  #[error("Splice relay failed")]
  Io(#[from] std::io::Error),
}

/// Bytes relayed in each direction over the lifetime of a splice
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct SpliceReport {
  pub local_to_remote: u64,
  pub remote_to_local: u64,
}

pub struct SpliceEndpoint {
  side: SpliceSide,
  sender: oneshot::Sender<WrappedStream>,
  status: Arc<watch::Sender<SpliceStatus>>,
}

impl std::fmt::Debug for SpliceEndpoint {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SpliceEndpoint")
      .field("side", &self.side)
      .finish_non_exhaustive()
  }
}

impl SpliceEndpoint {
  pub fn side(&self) -> SpliceSide {
    self.side
  }

  /// Hands a stream to the splice, marking this side ready
  ///
  /// Fails if the splice itself is gone, in which case the stream is dropped.
  pub fn bind<S: Into<WrappedStream>>(self, stream: S) -> Result<(), SpliceError> {
    let Self {
      side,
      sender,
      status,
    } = self;
    if sender.send(stream.into()).is_err() {
      tracing::trace!(?side, "Splice dropped before endpoint was bound");
      return Err(SpliceError::Abandoned);
    }
    status.send_modify(|status| {
      if let SpliceStatus::Pending {
        local_ready,
        remote_ready,
      } = status
      {
        match side {
          SpliceSide::Local => *local_ready = true,
          SpliceSide::Remote => *remote_ready = true,
        }
      }
    });
    Ok(())
  }
}

pub struct Splice {
  buffer_capacity: usize,
  local: oneshot::Receiver<WrappedStream>,
  remote: oneshot::Receiver<WrappedStream>,
  status: Arc<watch::Sender<SpliceStatus>>,
}

impl std::fmt::Debug for Splice {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Splice")
      .field("status", &self.status())
      .field("buffer_capacity", &self.buffer_capacity)
      .finish_non_exhaustive()
  }
}

impl Splice {
  /// Creates a pending splice and its local and remote endpoints
  pub fn new(buffer_capacity: usize) -> (Splice, SpliceEndpoint, SpliceEndpoint) {
    let (status, _) = watch::channel(SpliceStatus::Pending {
      local_ready: false,
      remote_ready: false,
    });
    let status = Arc::new(status);
    let (local_sender, local) = oneshot::channel();
    let (remote_sender, remote) = oneshot::channel();
    (
      Splice {
        buffer_capacity: buffer_capacity.max(1),
        local,
        remote,
        status: status.clone(),
      },
      SpliceEndpoint {
        side: SpliceSide::Local,
        sender: local_sender,
        status: status.clone(),
      },
      SpliceEndpoint {
        side: SpliceSide::Remote,
        sender: remote_sender,
        status,
      },
    )
  }

  pub fn status(&self) -> SpliceStatus {
    *self.status.borrow()
  }

  pub fn watch_status(&self) -> watch::Receiver<SpliceStatus> {
    self.status.subscribe()
  }

  /// Waits for both endpoints, then relays until both directions finish
  ///
  /// A direction reaching EOF shuts down the opposite writer while the other
  /// direction keeps flowing. A side whose peer closes entirely ends the
  /// direction writing into it at once. Both streams are dropped once the relay ends.
  pub async fn run(self) -> Result<SpliceReport, SpliceError> {
    let Self {
      buffer_capacity,
      local,
      remote,
      status,
    } = self;
    let (local, remote) = match futures::future::try_join(local, remote).await {
      Ok(streams) => streams,
      Err(_abandoned) => {
        tracing::debug!("Splice abandoned before activation");
        status.send_replace(SpliceStatus::Closed);
        return Err(SpliceError::Abandoned);
      }
    };
    status.send_replace(SpliceStatus::Active);
    tracing::trace!("Splice active");

    let (local_closure, remote_closure) = (local.peer_closure(), remote.peer_closure());
    let (local_read, local_write) = tokio::io::split(local);
    let (remote_read, remote_write) = tokio::io::split(remote);
    let relayed = futures::future::try_join(
      relay(
        local_read,
        remote_write,
        remote_closure,
        buffer_capacity,
        SpliceSide::Local,
      ),
      relay(
        remote_read,
        local_write,
        local_closure,
        buffer_capacity,
        SpliceSide::Remote,
      ),
    )
    .await;
    status.send_replace(SpliceStatus::Closed);
    match relayed {
      Ok((local_to_remote, remote_to_local)) => {
        tracing::trace!(local_to_remote, remote_to_local, "Splice closed");
        Ok(SpliceReport {
          local_to_remote,
          remote_to_local,
        })
      }
      Err(error) => {
        tracing::debug!(error = ?error, "Splice closed with error");
        Err(error.into())
      }
    }
  }
}

/// Copies `source` into `sink` until EOF, then shuts `sink` down
///
/// Gives up without shutting down once `sink_closed` fires.
async fn relay<R, W>(
  source: R,
  mut sink: W,
  sink_closed: Option<CancellationListener>,
  buffer_capacity: usize,
  from: SpliceSide,
) -> Result<u64, std::io::Error>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let sink_gone = async {
    match &sink_closed {
      Some(closed) => closed.cancelled().await,
      None => futures::future::pending::<()>().await,
    }
  };
  tokio::pin!(sink_gone);
  let mut source = BufReader::with_capacity(buffer_capacity, source);
  let mut copied = 0u64;
  loop {
    let chunk = tokio::select! {
      biased;
      _ = &mut sink_gone => {
        tracing::trace!(?from, bytes = copied, "Splice sink closed; abandoning direction");
        return Ok(copied);
      }
      chunk = source.fill_buf() => chunk?,
    };
    if chunk.is_empty() {
      break;
    }
    let len = chunk.len();
    tokio::select! {
      biased;
      _ = &mut sink_gone => {
        tracing::trace!(?from, bytes = copied, "Splice sink closed; abandoning direction");
        return Ok(copied);
      }
      written = sink.write_all(chunk) => written?,
    }
    source.consume(len);
    copied += len as u64;
  }
  tracing::trace!(?from, bytes = copied, "Splice direction reached EOF");
  if let Err(error) = sink.shutdown().await {
    // The far side may already be gone entirely
    tracing::trace!(?from, error = %error, "Failed to propagate half-close");
  }
  Ok(copied)
}
