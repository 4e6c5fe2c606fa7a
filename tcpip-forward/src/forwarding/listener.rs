// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! TCP listeners whose accepted connections are spliced onto `forwarded-tcpip` channels

use futures::{future::BoxFuture, StreamExt};
use std::{
  net::SocketAddr,
  sync::{Arc, Weak},
};
use tokio::{
  net::{TcpListener, TcpSocket, TcpStream},
  task::JoinHandle,
};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::{
  common::{
    channel::{ChannelDataAdapter, ChannelError, ChannelKind, ForwardedTcpIp},
    config::ForwardingConfig,
    error::ForwardingError,
    event_loop::EventLoop,
    session::{with_open_timeout, Session},
  },
  util::{cancellation::CancellationListener, dropkick::Dropkick, splice::Splice},
};

/// An active listener created for a remote forwarding request
///
/// Dropping it stops accepting without waiting for the socket to close; use
/// [`ForwardListener::stop`] to wait. Tunnels already established keep running
/// until either of their sides closes.
#[derive(Debug)]
pub struct ForwardListener {
  host: String,
  requested_port: u16,
  local_addr: SocketAddr,
  stop: Dropkick<CancellationToken>,
  accept_task: Option<JoinHandle<()>>,
}

impl ForwardListener {
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  pub fn bound_port(&self) -> u16 {
    self.local_addr.port()
  }

  pub fn host(&self) -> &str {
    &self.host
  }

  pub fn requested_port(&self) -> u16 {
    self.requested_port
  }

  /// Whether the listener is still accepting connections
  ///
  /// Turns false once the listener was stopped or its session closed.
  pub fn is_active(&self) -> bool {
    let stopped = self.stop.get().map_or(true, CancellationToken::is_cancelled);
    let accepting = self
      .accept_task
      .as_ref()
      .map_or(false, |accept_task| !accept_task.is_finished());
    !stopped && accepting
  }

  /// Stops accepting, closes the socket, and fails channel opens still pending for accepted connections
  pub async fn stop(mut self) {
    if let Some(token) = self.stop.get() {
      token.cancel();
    }
    if let Some(accept_task) = self.accept_task.take() {
      if let Err(error) = accept_task.await {
        tracing::debug!(error = %error, "Accept loop ended abnormally");
      }
    }
    tracing::debug!(addr = %self.local_addr, "Forward listener stopped");
  }
}

/// Binds `host:port` and starts pairing accepted connections with channels of `session`
///
/// When port 0 was requested, the port the OS assigned is returned alongside the listener.
pub async fn begin_listening<S: Session>(
  session: &Arc<S>,
  host: &str,
  port: u16,
  event_loop: &EventLoop,
  config: Arc<ForwardingConfig>,
) -> Result<(ForwardListener, Option<u16>), ForwardingError> {
  let session_closed = session.closed();
  let session = Arc::downgrade(session);
  let host = host.to_string();
  let spawn_loop = event_loop.clone();
  let listening = async move {
    let listener = bind_listener(&host, port, &config).await?;
    let local_addr = listener
      .local_addr()
      .map_err(|source| ForwardingError::BindFailure {
        addr: format!("{}:{}", host, port),
        source,
      })?;
    tracing::info!(addr = %local_addr, "Forward listener bound");
    let stop = CancellationToken::new();
    let accept_task = spawn_loop.spawn(
      accept_loop(
        listener,
        session,
        session_closed,
        host.clone(),
        local_addr.port(),
        config,
        CancellationListener::from(&stop),
      )
      .instrument(tracing::debug_span!("forward_listener", host = %host, port = local_addr.port())),
    );
    Ok::<_, ForwardingError>(ForwardListener {
      host,
      requested_port: port,
      local_addr,
      stop: Dropkick::new(stop),
      accept_task: Some(accept_task),
    })
  };
  let listener = event_loop.submit(listening).await??;
  let assigned = (port == 0).then(|| listener.bound_port());
  Ok((listener, assigned))
}

async fn bind_listener(
  host: &str,
  port: u16,
  config: &ForwardingConfig,
) -> Result<TcpListener, ForwardingError> {
  let bind_host = match host {
    "" | "*" => "0.0.0.0",
    other => other,
  };
  let bind_failure = |source: std::io::Error| ForwardingError::BindFailure {
    addr: format!("{}:{}", bind_host, port),
    source,
  };
  let mut last_error = None;
  for addr in tokio::net::lookup_host((bind_host, port))
    .await
    .map_err(bind_failure)?
  {
    match bind_socket(addr, config) {
      Ok(listener) => return Ok(listener),
      Err(error) => {
        tracing::debug!(addr = %addr, error = %error, "Failed to bind candidate address");
        last_error = Some(error);
      }
    }
  }
  Err(bind_failure(last_error.unwrap_or_else(|| {
    std::io::Error::new(
      std::io::ErrorKind::AddrNotAvailable,
      "Host resolved to no addresses",
    )
  })))
}

fn bind_socket(addr: SocketAddr, config: &ForwardingConfig) -> std::io::Result<TcpListener> {
  let socket = match addr {
    SocketAddr::V4(_) => TcpSocket::new_v4()?,
    SocketAddr::V6(_) => TcpSocket::new_v6()?,
  };
  // Accepted sockets inherit the option from the listening socket (BSD socket semantics)
  socket.set_reuseaddr(config.reuse_address)?;
  socket.bind(addr)?;
  socket.listen(config.listen_backlog)
}

async fn accept_loop<S: Session>(
  listener: TcpListener,
  session: Weak<S>,
  session_closed: BoxFuture<'static, ()>,
  host: String,
  bound_port: u16,
  config: Arc<ForwardingConfig>,
  stopped: CancellationListener,
) {
  let finished = async {
    tokio::select! {
      _ = stopped.cancelled() => tracing::trace!("Listener stopped"),
      _ = session_closed => tracing::debug!("Session closed; no longer accepting"),
    }
  };
  let mut incoming = TcpListenerStream::new(listener)
    .take_until(finished)
    .boxed();
  while let Some(accepted) = incoming.next().await {
    let stream = match accepted {
      Ok(stream) => stream,
      Err(error) => {
        tracing::warn!(error = %error, "Failed to accept connection");
        continue;
      }
    };
    let originator = match stream.peer_addr() {
      Ok(addr) => addr,
      Err(error) => {
        tracing::debug!(error = %error, "Dropping connection without a peer address");
        continue;
      }
    };
    let session = match session.upgrade() {
      Some(session) => session,
      None => {
        tracing::debug!("Session is gone; no longer accepting");
        break;
      }
    };
    let forwarded = ForwardedTcpIp {
      listening_host: host.clone(),
      listening_port: bound_port,
      originator,
    };
    tokio::task::spawn(
      handle_connection(session, stream, forwarded, config.clone(), stopped.child_token())
        .instrument(tracing::debug_span!("forwarded_connection", originator = %originator)),
    );
  }
  tracing::trace!("Accept loop finished; closing listener socket");
}

async fn handle_connection<S: Session>(
  session: Arc<S>,
  stream: TcpStream,
  forwarded: ForwardedTcpIp,
  config: Arc<ForwardingConfig>,
  stopped: CancellationToken,
) {
  let (splice, local, remote) = Splice::new(config.splice_buffer_capacity);
  if local.bind(stream).is_err() {
    return;
  }
  let open = session.create_channel(forwarded.into(), move |channel, resolved| async move {
    if resolved.kind() != ChannelKind::ForwardedTcpIp {
      return Err(ChannelError::UnexpectedChannelType {
        expected: ChannelKind::ForwardedTcpIp,
        actual: resolved.kind(),
      });
    }
    let adapter = ChannelDataAdapter::attach(channel)?;
    remote.bind(adapter).map_err(|_| ChannelError::ChannelClosed)
  });
  drop(session);

  let opened = tokio::select! {
    opened = with_open_timeout(open, config.channel_open_timeout()) => opened,
    _ = stopped.cancelled() => Err(ChannelError::ListenerStopped),
  };
  if let Err(error) = opened {
    // Dropping the splice closes the accepted connection
    tracing::warn!(error = %error, "Failed to open forwarded channel; closing connection");
    return;
  }
  match splice.run().await {
    Ok(report) => tracing::debug!(
      local_to_remote = report.local_to_remote,
      remote_to_local = report.remote_to_local,
      "Forwarded connection closed"
    ),
    Err(error) => tracing::debug!(error = %error, "Forwarded connection failed"),
  }
}

#[cfg(test)]
mod tests {
  use super::begin_listening;
  use crate::{
    common::{
      channel::{ChannelDataAdapter, ChannelError, ChannelType},
      config::ForwardingConfig,
      error::ForwardingError,
      event_loop::EventLoop,
      session::memory::{pair, EntangledSessions, MemorySession},
    },
    test_util::{init_tracing, TEST_TIMEOUT},
  };
  use std::{sync::Arc, time::Duration};
  use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
  };

  struct Fixture {
    server_loop: EventLoop,
    listening: Arc<MemorySession>,
    peer: MemorySession,
  }

  fn fixture(name: &str, config: &ForwardingConfig) -> Fixture {
    init_tracing();
    let server_loop = EventLoop::start(name).unwrap();
    let EntangledSessions { client, server } =
      pair(config, EventLoop::current().unwrap(), server_loop.clone());
    Fixture {
      server_loop,
      listening: Arc::new(server),
      peer: client,
    }
  }

  /// Reads until EOF or a reset, whichever the platform reports
  async fn wait_for_closure(stream: &mut TcpStream) {
    let mut rest = Vec::new();
    let _ = timeout(TEST_TIMEOUT, stream.read_to_end(&mut rest))
      .await
      .expect("Connection was not closed");
  }

  #[tokio::test]
  async fn relays_bytes_between_connection_and_channel() {
    let config = ForwardingConfig::default();
    let fx = fixture("relay-test", &config);
    let (listener, assigned) = begin_listening(
      &fx.listening,
      "127.0.0.1",
      0,
      &fx.server_loop,
      Arc::new(config),
    )
    .await
    .unwrap();
    let port = assigned.unwrap();
    assert_ne!(port, 0);
    assert_eq!(listener.bound_port(), port);
    assert_eq!(listener.requested_port(), 0);
    assert_eq!(listener.host(), "127.0.0.1");

    let mut tcp = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let incoming = timeout(TEST_TIMEOUT, fx.peer.next_incoming())
      .await
      .unwrap()
      .unwrap();
    match incoming.channel_type() {
      ChannelType::ForwardedTcpIp(forwarded) => {
        assert_eq!(forwarded.listening_port, port);
        assert_eq!(forwarded.listening_host, "127.0.0.1");
        assert_eq!(forwarded.originator, tcp.local_addr().unwrap());
      }
      other => panic!("Unexpected channel type {:?}", other),
    }
    let mut remote = ChannelDataAdapter::attach(incoming.accept().unwrap()).unwrap();

    let request = Vec::from(*b"0123456789").repeat(1000);
    let response = Vec::from(*b"abcdef").repeat(2000);
    let exchange = async {
      tcp.write_all(&request).await.unwrap();
      let mut received = vec![0u8; request.len()];
      remote.read_exact(&mut received).await.unwrap();
      assert_eq!(received, request);
      remote.write_all(&response).await.unwrap();
      let mut received = vec![0u8; response.len()];
      tcp.read_exact(&mut received).await.unwrap();
      assert_eq!(received, response);
    };
    timeout(TEST_TIMEOUT, exchange).await.unwrap();

    // The connection closing reaches the channel, and the channel closing reaches the connection
    tcp.shutdown().await.unwrap();
    let mut rest = Vec::new();
    timeout(TEST_TIMEOUT, remote.read_to_end(&mut rest))
      .await
      .unwrap()
      .unwrap();
    assert!(rest.is_empty());
    drop(remote);
    wait_for_closure(&mut tcp).await;

    listener.stop().await;
  }

  #[tokio::test]
  async fn explicit_port_reports_no_assignment() {
    let config = ForwardingConfig::default();
    let fx = fixture("explicit-port-test", &config);
    let port = std::net::TcpListener::bind("127.0.0.1:0")
      .unwrap()
      .local_addr()
      .unwrap()
      .port();
    let (listener, assigned) = begin_listening(
      &fx.listening,
      "127.0.0.1",
      port,
      &fx.server_loop,
      Arc::new(config),
    )
    .await
    .unwrap();
    assert_eq!(assigned, None);
    assert_eq!(listener.bound_port(), port);
    listener.stop().await;
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
  }

  #[tokio::test]
  async fn occupied_port_is_a_bind_failure() {
    let config = ForwardingConfig::default();
    let fx = fixture("bind-failure-test", &config);
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();
    let result = begin_listening(
      &fx.listening,
      "127.0.0.1",
      port,
      &fx.server_loop,
      Arc::new(config),
    )
    .await;
    match result {
      Err(ForwardingError::BindFailure { addr, .. }) => {
        assert_eq!(addr, format!("127.0.0.1:{}", port))
      }
      other => panic!("Expected a bind failure, got {:?}", other.map(|(l, _)| l)),
    }
  }

  #[tokio::test]
  async fn stopping_fails_pending_channel_opens() {
    let config = ForwardingConfig::default();
    let fx = fixture("stop-pending-test", &config);
    let (listener, assigned) = begin_listening(
      &fx.listening,
      "127.0.0.1",
      0,
      &fx.server_loop,
      Arc::new(config),
    )
    .await
    .unwrap();
    let port = assigned.unwrap();
    let mut tcp = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    // Hold the open request without answering it
    let incoming = timeout(TEST_TIMEOUT, fx.peer.next_incoming())
      .await
      .unwrap()
      .unwrap();

    timeout(TEST_TIMEOUT, listener.stop()).await.unwrap();
    wait_for_closure(&mut tcp).await;
    assert!(matches!(incoming.accept(), Err(ChannelError::ChannelClosed)));
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
  }

  #[tokio::test]
  async fn open_timeout_closes_the_connection() {
    let config = ForwardingConfig::default().with_channel_open_timeout(Duration::from_millis(100));
    let fx = fixture("open-timeout-test", &config);
    let (listener, assigned) = begin_listening(
      &fx.listening,
      "127.0.0.1",
      0,
      &fx.server_loop,
      Arc::new(config),
    )
    .await
    .unwrap();
    let mut tcp = TcpStream::connect(("127.0.0.1", assigned.unwrap()))
      .await
      .unwrap();
    let _unanswered = timeout(TEST_TIMEOUT, fx.peer.next_incoming())
      .await
      .unwrap()
      .unwrap();
    wait_for_closure(&mut tcp).await;

    // The listener itself survives the failed connection
    let _second = TcpStream::connect(("127.0.0.1", listener.bound_port()))
      .await
      .unwrap();
    assert!(timeout(TEST_TIMEOUT, fx.peer.next_incoming())
      .await
      .unwrap()
      .is_some());
    listener.stop().await;
  }

  #[tokio::test]
  async fn rejected_channel_closes_the_connection() {
    let config = ForwardingConfig::default();
    let fx = fixture("rejected-open-test", &config);
    let (listener, assigned) = begin_listening(
      &fx.listening,
      "127.0.0.1",
      0,
      &fx.server_loop,
      Arc::new(config),
    )
    .await
    .unwrap();
    let mut tcp = TcpStream::connect(("127.0.0.1", assigned.unwrap()))
      .await
      .unwrap();
    timeout(TEST_TIMEOUT, fx.peer.next_incoming())
      .await
      .unwrap()
      .unwrap()
      .reject("connect failed");
    wait_for_closure(&mut tcp).await;
    listener.stop().await;
  }

  #[tokio::test]
  async fn session_close_stops_accepting() {
    let config = ForwardingConfig::default();
    let fx = fixture("session-close-test", &config);
    let (listener, assigned) = begin_listening(
      &fx.listening,
      "127.0.0.1",
      0,
      &fx.server_loop,
      Arc::new(config),
    )
    .await
    .unwrap();
    let port = assigned.unwrap();
    assert!(listener.is_active());

    // No connection arrives; the close alone must release the socket
    fx.peer.close();
    timeout(TEST_TIMEOUT, async {
      while listener.is_active() {
        tokio::time::sleep(Duration::from_millis(20)).await;
      }
    })
    .await
    .expect("Listener outlived its session");
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    listener.stop().await;
  }

  #[tokio::test]
  async fn stopped_port_can_be_bound_again() {
    let config = Arc::new(ForwardingConfig::default());
    let fx = fixture("rebind-test", &config);
    let (listener, assigned) = begin_listening(
      &fx.listening,
      "127.0.0.1",
      0,
      &fx.server_loop,
      config.clone(),
    )
    .await
    .unwrap();
    let port = assigned.unwrap();
    let mut tcp = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let _unanswered = timeout(TEST_TIMEOUT, fx.peer.next_incoming())
      .await
      .unwrap()
      .unwrap();
    // Our side closes the accepted connection first, leaving it in TIME_WAIT
    listener.stop().await;
    wait_for_closure(&mut tcp).await;
    drop(tcp);

    let (rebound, assigned) = begin_listening(
      &fx.listening,
      "127.0.0.1",
      port,
      &fx.server_loop,
      config,
    )
    .await
    .unwrap();
    assert_eq!(assigned, None);
    assert_eq!(rebound.bound_port(), port);
    rebound.stop().await;
  }
}
