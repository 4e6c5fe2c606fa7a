// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use bytes::Bytes;

/// Extended-data code SSH assigns to a remote process's stderr
pub const EXTENDED_DATA_STDERR: u32 = 1;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ChannelDataType {
  /// Ordinary channel data
  Channel,
  /// Out-of-band data tagged with an extended-data code
  Extended(u32),
}

/// A tagged data frame as delivered by the channel transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
  pub data_type: ChannelDataType,
  pub data: Bytes,
}

impl ChannelData {
  pub fn channel<T: Into<Bytes>>(data: T) -> Self {
    Self {
      data_type: ChannelDataType::Channel,
      data: data.into(),
    }
  }

  pub fn extended<T: Into<Bytes>>(code: u32, data: T) -> Self {
    Self {
      data_type: ChannelDataType::Extended(code),
      data: data.into(),
    }
  }

  pub fn is_channel_data(&self) -> bool {
    matches!(self.data_type, ChannelDataType::Channel)
  }
}

/// Everything a frame-level channel carries between the two ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
  Data(ChannelData),
  /// The sender will write no more data; it may keep reading
  Eof,
  /// The sender released the channel entirely
  Close,
}
