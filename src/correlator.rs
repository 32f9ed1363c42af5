//! Matches requests with their responses.
//!
//! The device interleaves unsolicited lines (boot messages, logging, stale responses)
//! with the answers we asked for. Those are skipped until the expected response
//! arrives or the deadline passes.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{
    error::Error,
    protocol::{Payload, ProtocolCodec, RequestKind},
    records::{Configs, Info},
    serial::{error::SerialPortError, SerialMessage},
    transport::Transport,
};

/// Sends requests and waits for their responses.
#[derive(Debug, Clone, Default)]
pub struct RequestCorrelator {
    codec: ProtocolCodec,
}

impl RequestCorrelator {
    /// A correlator using the given codec.
    pub fn new(codec: ProtocolCodec) -> Self {
        Self { codec }
    }

    /// Borrow the codec.
    pub fn codec(&self) -> &ProtocolCodec {
        &self.codec
    }

    /// Send a request and wait for its response.
    ///
    /// The whole exchange, including skipped lines, must fit in `timeout`.
    /// Lines left over from earlier exchanges are discarded first.
    pub async fn request(
        &self,
        transport: &mut Transport,
        kind: RequestKind,
        timeout: Duration,
    ) -> Result<Payload, Error> {
        let stale = transport.discard_pending().await?;
        if stale > 0 {
            debug!(stale, "Discarded lines before `{kind}`");
        }

        transport.write_line(&self.codec.encode_request(kind)).await?;

        let deadline = Instant::now() + timeout;
        let timed_out = || Error::Timeout {
            expected: kind.response_type(),
            millis: timeout.as_millis() as u64,
        };

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(timed_out());
            }

            let line = match transport.read_line(remaining).await {
                Ok(line) => line,
                Err(SerialPortError::Timeout(_)) => return Err(timed_out()),
                Err(e) => return Err(e.into()),
            };

            let envelope = match self.codec.decode_line(&line) {
                Ok(envelope) => envelope,
                Err(e) => {
                    debug!(%e, "Skipping undecodable line");
                    continue;
                }
            };

            if !envelope.is_response_to(kind) {
                trace!(
                    message_type = %envelope.message_type,
                    "Skipping `{}`",
                    SerialMessage::new_lossy(&line)
                );
                continue;
            }

            return self.codec.decode_payload(kind, envelope.into_value());
        }
    }

    /// Request live telemetry.
    pub async fn info(&self, transport: &mut Transport, timeout: Duration) -> Result<Info, Error> {
        self.request(transport, RequestKind::Info, timeout)
            .await?
            .try_into_info()
            .map_err(|other| mismatch(RequestKind::Info, other))
    }

    /// Request the current configuration.
    pub async fn configs(
        &self,
        transport: &mut Transport,
        timeout: Duration,
    ) -> Result<Configs, Error> {
        self.request(transport, RequestKind::Configs, timeout)
            .await?
            .try_into_configs()
            .map_err(|other| mismatch(RequestKind::Configs, other))
    }
}

fn mismatch(kind: RequestKind, got: Payload) -> Error {
    Error::Schema {
        kind: kind.to_string(),
        problem: format!("got a `{}` payload instead", got.kind()),
    }
}
