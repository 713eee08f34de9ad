//! The protocol engine: framed messages over a [`Transport`].
//!
//! A connection is used in one of two roles. The calling side sends a
//! `Request` and waits for the `Response` carrying the same id. The serving
//! side reads requests and writes responses. Each channel direction is a
//! separate connection, so a connection never mixes both roles.

use crate::error::{CallError, ConnectionError, ProtocolError, TransportError};
use crate::protocol::{
    EXIT_FAILURE, FrameDecoder, Request, Response, decode_payload, encode_frame,
};
use crate::transport::Transport;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::time::Instant;

pub struct Connection<T> {
    transport: T,
    decoder: FrameDecoder,
}

impl<T: Transport> Connection<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            decoder: FrameDecoder::new(),
        }
    }

    pub fn label(&self) -> &str {
        self.transport.label()
    }

    pub async fn send<M: Serialize + Sync>(&mut self, message: &M) -> Result<(), ConnectionError> {
        let frame = encode_frame(message)?;
        tracing::trace!("Sending frame of {} bytes to {}", frame.len(), self.label());
        self.transport.send(&frame).await?;
        Ok(())
    }

    /// Wait for the next complete frame and decode it.
    ///
    /// Cancel-safe: bytes are only buffered after a read has completed.
    pub async fn receive<M: DeserializeOwned>(
        &mut self,
        deadline: Option<Instant>,
    ) -> Result<M, ConnectionError> {
        let payload = self.next_payload(deadline).await?;
        Ok(decode_payload(&payload)?)
    }

    async fn next_payload(&mut self, deadline: Option<Instant>) -> Result<Vec<u8>, ConnectionError> {
        loop {
            if let Some(payload) = self.decoder.next_frame()? {
                tracing::trace!(
                    "Received frame from {}: {}",
                    self.transport.label(),
                    String::from_utf8_lossy(&payload)
                );
                return Ok(payload);
            }

            let remaining = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(TransportError::Timeout.into());
                    }
                    Some(left)
                }
                None => None,
            };

            let data = self.transport.receive(remaining).await?;
            self.decoder.push(&data);
        }
    }

    /// Serving side: wait for the next request from the peer.
    ///
    /// A frame that is well delimited but not a valid request is logged and
    /// skipped; there is no id to answer it with.
    pub async fn next_request(&mut self) -> Result<Request, ConnectionError> {
        loop {
            let payload = self.next_payload(None).await?;
            match decode_payload::<Request>(&payload) {
                Ok(request) => return Ok(request),
                Err(e) => {
                    tracing::warn!("Ignoring undecodable request from {}: {}", self.label(), e);
                }
            }
        }
    }

    /// Serving side: answer a request.
    ///
    /// A response too large for one frame is replaced by a failure carrying
    /// the same id, so the caller is always answered.
    pub async fn respond(&mut self, response: &Response) -> Result<(), ConnectionError> {
        match self.send(response).await {
            Err(ConnectionError::Protocol(ProtocolError::FrameTooLarge(size))) => {
                tracing::warn!(
                    "Response {} of {} bytes does not fit in a frame",
                    response.id,
                    size
                );
                let failure = Response::failure(
                    &response.id,
                    EXIT_FAILURE,
                    format!("response of {} bytes exceeds the maximum frame size", size),
                );
                self.send(&failure).await
            }
            result => result,
        }
    }

    /// Calling side: send `request` and wait for its response.
    ///
    /// `timeout` of `None` waits indefinitely. Responses carrying another id
    /// are answers to calls that already timed out; they are discarded.
    pub async fn call(
        &mut self,
        request: &Request,
        timeout: Option<Duration>,
    ) -> Result<Response, CallError> {
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);
        tracing::debug!(
            "Calling remote command {} {:?} over {}",
            request.command,
            request.arguments,
            self.label()
        );

        self.send(request).await?;

        loop {
            let response: Response = match self.receive(deadline).await {
                Ok(response) => response,
                Err(ConnectionError::Transport(TransportError::Timeout)) => {
                    let limit = timeout.unwrap_or_default();
                    tracing::warn!(
                        "Remote command {} timed out after {:?}",
                        request.command,
                        limit
                    );
                    return Err(CallError::RemoteCallTimedOut(limit));
                }
                Err(e) => return Err(e.into()),
            };

            if response.id != request.id {
                tracing::debug!("Discarding stale response {} from {}", response.id, self.label());
                continue;
            }

            tracing::debug!(
                "Remote command {} finished in {:?} with status {}",
                request.command,
                started.elapsed(),
                response.exit_status
            );
            return Ok(response);
        }
    }

    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.transport.close().await
    }
}
