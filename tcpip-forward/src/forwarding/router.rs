// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use futures::future::{BoxFuture, FutureExt};
use std::{
  net::SocketAddr,
  sync::{Arc, Weak},
};

use super::listener::{begin_listening, ForwardListener};
use crate::common::{
  config::ForwardingConfig, error::ForwardingError, event_loop::EventLoop, session::Session,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TcpForwardingRequest {
  /// Bind `host:port` and forward its connections to the peer; port 0 lets the OS choose
  Listen { host: String, port: u16 },
  Cancel,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TcpForwardingResponse {
  /// The port the OS assigned when port 0 was requested
  pub bound_port: Option<u16>,
}

/// Answers the peer's TCP/IP forwarding requests for one session
pub trait ForwardingRequestHandler: Send + Sync {
  fn tcp_forwarding_request(
    &self,
    request: TcpForwardingRequest,
  ) -> BoxFuture<'static, Result<TcpForwardingResponse, ForwardingError>>;
}

/// Serves listen and cancel requests with at most one active listener
///
/// Only a single listener is tracked per session, whatever host and port it
/// was bound to. Dropping the router stops that listener; a listener that
/// ended with its session no longer counts.
pub struct ForwardRequestRouter<S: Session> {
  session: Weak<S>,
  event_loop: EventLoop,
  config: Arc<ForwardingConfig>,
  slot: Arc<tokio::sync::Mutex<Option<ForwardListener>>>,
}

impl<S: Session> std::fmt::Debug for ForwardRequestRouter<S> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ForwardRequestRouter")
      .field("event_loop", &self.event_loop)
      .finish_non_exhaustive()
  }
}

impl<S: Session> ForwardRequestRouter<S> {
  pub fn new(session: &Arc<S>, config: Arc<ForwardingConfig>) -> Self {
    Self {
      session: Arc::downgrade(session),
      event_loop: session.event_loop().clone(),
      config,
      slot: Arc::new(tokio::sync::Mutex::new(None)),
    }
  }

  pub fn listen(
    &self,
    host: String,
    port: u16,
  ) -> BoxFuture<'static, Result<TcpForwardingResponse, ForwardingError>> {
    let session = self.session.clone();
    let event_loop = self.event_loop.clone();
    let config = self.config.clone();
    let slot = self.slot.clone();
    let listening = async move {
      // Held across the bind so a concurrent request sees the outcome
      let mut slot = slot.lock().await;
      match slot.as_ref() {
        Some(existing) if existing.is_active() => {
          tracing::debug!(addr = %existing.local_addr(), "Refusing listen; already listening");
          return Err(ForwardingError::AlreadyListening);
        }
        Some(existing) => {
          tracing::debug!(addr = %existing.local_addr(), "Discarding listener that stopped on its own");
          slot.take();
        }
        None => (),
      }
      let session = session.upgrade().ok_or(ForwardingError::SessionClosed)?;
      let (listener, bound_port) =
        begin_listening(&session, &host, port, &event_loop, config).await?;
      tracing::info!(addr = %listener.local_addr(), "Forwarding listener registered");
      *slot = Some(listener);
      Ok::<_, ForwardingError>(TcpForwardingResponse { bound_port })
    };
    let submitted = self.event_loop.submit(listening);
    async move { submitted.await? }.boxed()
  }

  pub fn cancel(&self) -> BoxFuture<'static, Result<TcpForwardingResponse, ForwardingError>> {
    let slot = self.slot.clone();
    let cancelling = async move {
      let mut slot = slot.lock().await;
      let listener = slot
        .take()
        .filter(ForwardListener::is_active)
        .ok_or(ForwardingError::NotListening)?;
      tracing::info!(addr = %listener.local_addr(), "Cancelling forwarding listener");
      listener.stop().await;
      Ok::<_, ForwardingError>(TcpForwardingResponse { bound_port: None })
    };
    let submitted = self.event_loop.submit(cancelling);
    async move { submitted.await? }.boxed()
  }

  pub async fn is_listening(&self) -> bool {
    self
      .slot
      .lock()
      .await
      .as_ref()
      .map_or(false, ForwardListener::is_active)
  }

  pub async fn listening_addr(&self) -> Option<SocketAddr> {
    self
      .slot
      .lock()
      .await
      .as_ref()
      .filter(|listener| listener.is_active())
      .map(ForwardListener::local_addr)
  }
}

impl<S: Session> ForwardingRequestHandler for ForwardRequestRouter<S> {
  fn tcp_forwarding_request(
    &self,
    request: TcpForwardingRequest,
  ) -> BoxFuture<'static, Result<TcpForwardingResponse, ForwardingError>> {
    match request {
      TcpForwardingRequest::Listen { host, port } => self.listen(host, port),
      TcpForwardingRequest::Cancel => self.cancel(),
    }
  }
}

impl<S: Session> Drop for ForwardRequestRouter<S> {
  fn drop(&mut self) {
    match self.slot.try_lock() {
      Ok(mut slot) => {
        if let Some(listener) = slot.take() {
          tracing::debug!(addr = %listener.local_addr(), "Router dropped; stopping listener");
          drop(listener);
        }
      }
      Err(_in_use) => {
        // A request in flight owns the slot; clear it once that request settles
        let slot = self.slot.clone();
        self.event_loop.spawn(async move {
          slot.lock().await.take();
        });
      }
    }
  }
}
