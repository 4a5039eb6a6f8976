use std::time::Duration;

use anyhow::bail;

use crate::packet::ScpResponse;

/// Per-connection parameters. All requests issued on a connection share these;
///  they are immutable for the connection's lifetime - changing them means
///  opening a new connection.
#[derive(Clone, Debug)]
pub struct ScpConfig {
    /// The maximum data-field length per packet, negotiated with the remote side
    ///  out of band (the fabric advertises it in its version response).
    ///
    /// Bulk transfers are chunked at this size, and outbound payloads above it are
    ///  rejected. Choosing it bigger than the remote side supports makes the remote
    ///  side drop or truncate packets; choosing it smaller wastes round trips.
    pub scp_data_length: usize,

    /// How long to wait for a response before retransmitting.
    pub timeout: Duration,

    /// Number of *re*transmissions after the initial send; a request makes at most
    ///  `max_retries + 1` transmission attempts before failing with `Timeout`.
    pub max_retries: u32,

    /// Size of the outstanding-request slot pool, i.e. the number of requests that
    ///  may be in flight concurrently. Requests beyond this wait in a FIFO backlog.
    pub n_outstanding: usize,
}

impl ScpConfig {
    /// Defaults suitable for a fabric on a local network: 256-byte data field
    ///  (every SCP implementation supports that much), a conservative half-second
    ///  timeout and modest pipelining.
    pub fn default_local() -> ScpConfig {
        ScpConfig {
            scp_data_length: 256,
            timeout: Duration::from_millis(500),
            max_retries: 4,
            n_outstanding: 8,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.scp_data_length == 0 {
            bail!("data-field length must be non-zero");
        }
        if self.n_outstanding == 0 {
            bail!("slot pool must hold at least one outstanding request");
        }
        // sequence numbers must stay unique among active slots
        if self.n_outstanding > u16::MAX as usize {
            bail!("slot pool cannot exceed the sequence number space");
        }
        if self.timeout.is_zero() {
            bail!("timeout must be non-zero");
        }
        Ok(())
    }

    /// Size of the receive buffer: big enough for any well-formed response given
    ///  the negotiated data-field length.
    pub(crate) fn max_response_len(&self) -> usize {
        crate::packet::HEADER_LEN + 4 * ScpResponse::MAX_ARGS + self.scp_data_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[test]
    fn test_default_valid() {
        assert!(ScpConfig::default_local().validate().is_ok());
    }

    #[rstest]
    #[case::zero_data_length(ScpConfig { scp_data_length: 0, ..ScpConfig::default_local() })]
    #[case::zero_slots(ScpConfig { n_outstanding: 0, ..ScpConfig::default_local() })]
    #[case::too_many_slots(ScpConfig { n_outstanding: 100_000, ..ScpConfig::default_local() })]
    #[case::zero_timeout(ScpConfig { timeout: Duration::ZERO, ..ScpConfig::default_local() })]
    fn test_validate_rejects(#[case] config: ScpConfig) {
        assert!(config.validate().is_err());
    }
}
