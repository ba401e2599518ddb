// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod api;
mod authorization;
mod errors;
mod http_client;
mod tunnel_locator;
mod tunnel_request_options;

pub use api::*;
pub use authorization::*;
pub use errors::*;
pub use http_client::*;
pub use tunnel_locator::*;
pub use tunnel_request_options::*;
