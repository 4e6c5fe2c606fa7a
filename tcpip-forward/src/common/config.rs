// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::Context as AnyhowContext;
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

/// Tunables shared by forward listeners, splices, and tunnel channel creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ForwardingConfig {
  /// Read buffer used for each direction of a splice
  pub splice_buffer_capacity: usize,
  /// Frames queued per channel direction before writers see backpressure
  pub channel_buffer_frames: usize,
  pub listen_backlog: u32,
  /// Applies `SO_REUSEADDR` to the listening socket; accepted sockets inherit it
  pub reuse_address: bool,
  /// Upper bound on a channel-open round trip; unbounded when absent
  pub channel_open_timeout_ms: Option<u64>,
}

pub const DEFAULT_SPLICE_BUFFER_CAPACITY: usize = 1024 * 32;
pub const DEFAULT_CHANNEL_BUFFER_FRAMES: usize = 64;
pub const DEFAULT_LISTEN_BACKLOG: u32 = 1024;

impl Default for ForwardingConfig {
  fn default() -> Self {
    Self {
      splice_buffer_capacity: DEFAULT_SPLICE_BUFFER_CAPACITY,
      channel_buffer_frames: DEFAULT_CHANNEL_BUFFER_FRAMES,
      listen_backlog: DEFAULT_LISTEN_BACKLOG,
      reuse_address: true,
      channel_open_timeout_ms: None,
    }
  }
}

impl ForwardingConfig {
  pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
    let config: Self = serde_json::from_str(json).context("Invalid forwarding configuration")?;
    config.validate()?;
    Ok(config)
  }

  pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
      .with_context(|| format!("Reading forwarding configuration from {}", path.display()))?;
    Self::from_json_str(&content)
  }

  pub fn validate(&self) -> anyhow::Result<()> {
    anyhow::ensure!(
      self.splice_buffer_capacity > 0,
      "splice_buffer_capacity must be non-zero"
    );
    anyhow::ensure!(
      self.channel_buffer_frames > 0,
      "channel_buffer_frames must be non-zero"
    );
    anyhow::ensure!(
      self.channel_open_timeout_ms != Some(0),
      "channel_open_timeout_ms must be non-zero when set"
    );
    Ok(())
  }

  pub fn channel_open_timeout(&self) -> Option<Duration> {
    self.channel_open_timeout_ms.map(Duration::from_millis)
  }

  pub fn with_channel_open_timeout(mut self, timeout: Duration) -> Self {
    self.channel_open_timeout_ms = Some(timeout.as_millis().max(1) as u64);
    self
  }
}
