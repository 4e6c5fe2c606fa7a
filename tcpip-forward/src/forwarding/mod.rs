// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Remote port forwarding and client-initiated tunnel channels

pub mod direct;
pub mod listener;
pub mod router;

pub use direct::{no_preamble, DirectTunnelFactory};
pub use listener::{begin_listening, ForwardListener};
pub use router::{
  ForwardRequestRouter, ForwardingRequestHandler, TcpForwardingRequest, TcpForwardingResponse,
};
