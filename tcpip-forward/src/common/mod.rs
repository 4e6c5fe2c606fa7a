// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod channel;
pub mod config;
pub mod error;
pub mod event_loop;
pub mod session;
