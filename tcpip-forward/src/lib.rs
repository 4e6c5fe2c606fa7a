// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! TCP/IP forwarding over the multiplexed channels of an SSH-style session
//!
//! Two directions are supported:
//!
//! - Remote forwarding, where a [`forwarding::ForwardRequestRouter`] answers
//!   listen/cancel requests by binding a [`forwarding::ForwardListener`] that
//!   pairs every accepted TCP connection with a fresh `forwarded-tcpip` channel.
//! - Client-initiated tunnels, where a [`forwarding::DirectTunnelFactory`] opens
//!   `direct-tcpip` or `forwarded-tcpip` channels for application use.
//!
//! The session and its channel multiplexer are external collaborators, consumed
//! through the [`common::session::Session`] trait.
#![forbid(unsafe_code)]

pub mod common;
pub mod forwarding;
pub mod util;

pub use common::{config::ForwardingConfig, error::ForwardingError};
