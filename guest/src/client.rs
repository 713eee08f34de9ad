//! One-shot calls from the guest to the host.

use crate::daemon::{GuestConfig, require_host};
use crate::error::GuestError;
use crate::transport::CharacterDevice;
use parley_core::config::GUEST_TO_HOST_CHANNEL;
use parley_core::{Connection, Request, Response};
use std::time::Duration;

/// Send `request` over the guest→host port and wait for the answer.
pub async fn call_host(
    config: &GuestConfig,
    request: Request,
    timeout: Option<Duration>,
) -> Result<Response, GuestError> {
    let path = config.resolve_device(GUEST_TO_HOST_CHANNEL).await?;
    let device = require_host(CharacterDevice::open(&path, config.busy_retry).await?)?;

    let mut connection = Connection::new(device);
    let result = connection.call(&request, timeout).await;
    let _ = connection.close().await;
    Ok(result?)
}
