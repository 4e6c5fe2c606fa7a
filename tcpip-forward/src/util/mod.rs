// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod cancellation;
pub mod dropkick;
pub mod splice;
pub mod tunnel_stream;
