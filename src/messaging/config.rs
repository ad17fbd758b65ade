use std::time::Duration;

use anyhow::bail;

pub struct ChannelConfig {
    /// The interval at which all unacknowledged reliable messages are re-sent. There is no
    ///  backoff and no limit on the number of retries: a message is re-sent until it is
    ///  acknowledged or explicitly dropped.
    pub resend_interval: Duration,

    /// The timeout for requests that are issued without an explicit timeout
    pub default_request_timeout: Duration,

    /// This is the maximum size of a datagram (including the envelope) that is sent or
    ///  accepted. There is no fragmentation, so a message must fit into a single datagram.
    ///
    /// With full Ethernet frames and no optional IP headers, the UDP payload is
    ///  `1500 - 20 - 8 = 1472` for IPV4 and `1500 - 40 - 8 = 1452` for IPV6. Choosing this value
    ///  too big causes datagrams to be fragmented at the IP level or dropped altogether.
    pub max_datagram_size: usize,

    /// If set, a reliable message that was already accepted is acknowledged again when it is
    ///  received a second time (it is still not dispatched a second time). This stops the
    ///  peer's retransmission of a message whose ACK was lost.
    ///
    /// Without this, only the next expected message triggers an ACK, and the loss of an ACK
    ///  causes the peer to re-send the message until its pending entry is dropped.
    pub reack_duplicates: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            resend_interval: Duration::from_millis(64),
            default_request_timeout: Duration::from_secs(5),
            max_datagram_size: 1472,
            reack_duplicates: false,
        }
    }
}

impl ChannelConfig {
    pub const MIN_DATAGRAM_SIZE: usize = 64;

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.resend_interval.is_zero() {
            bail!("resend interval must not be zero");
        }
        if self.default_request_timeout.is_zero() {
            bail!("default request timeout must not be zero");
        }
        if self.max_datagram_size < Self::MIN_DATAGRAM_SIZE {
            bail!("max datagram size must be at least {} bytes, was {}", Self::MIN_DATAGRAM_SIZE, self.max_datagram_size);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = ChannelConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.resend_interval, Duration::from_millis(64));
    }

    #[rstest]
    #[case::zero_resend_interval(ChannelConfig { resend_interval: Duration::ZERO, ..Default::default() })]
    #[case::zero_request_timeout(ChannelConfig { default_request_timeout: Duration::ZERO, ..Default::default() })]
    #[case::tiny_datagrams(ChannelConfig { max_datagram_size: 63, ..Default::default() })]
    fn test_validate_invalid(#[case] config: ChannelConfig) {
        assert!(config.validate().is_err());
    }
}
