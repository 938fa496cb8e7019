use std::fmt::{Debug, Formatter};
use std::time::Duration;
use anyhow::bail;
use bitflags::bitflags;
use crate::engine::channel::ListenerFactory;
use crate::ids::SecurityId;
use crate::protocol::versions::ProtocolVersions;

bitflags! {
    /// Per-channel behavior, chosen when listening or connecting
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ChannelOptions: u8 {
        /// Request the peer's features after negotiating the version, i.e. act as a controller
        const FEATURES_REQ = 1;
        /// Accept auxiliary connections, binding them to their datapath's main connection
        const AUXILIARY = 2;
        /// Listen on UDP as well as TCP
        const LISTEN_UDP = 4;
        /// Connect using UDP instead of TCP
        const CONNECT_UDP = 8;
    }
}

impl ChannelOptions {
    pub const DEFAULT_CONTROLLER: ChannelOptions = ChannelOptions::FEATURES_REQ;
    pub const DEFAULT_AGENT: ChannelOptions = ChannelOptions::empty();

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.contains(ChannelOptions::AUXILIARY) && !self.contains(ChannelOptions::FEATURES_REQ) {
            bail!("AUXILIARY requires FEATURES_REQ: {:?}", self);
        }
        if self.contains(ChannelOptions::LISTEN_UDP) && !self.contains(ChannelOptions::AUXILIARY) {
            bail!("LISTEN_UDP requires AUXILIARY: {:?}", self);
        }
        if self.contains(ChannelOptions::CONNECT_UDP) && self.contains(ChannelOptions::FEATURES_REQ) {
            bail!("CONNECT_UDP can not be combined with FEATURES_REQ: {:?}", self);
        }
        Ok(())
    }
}

/// Settings for the channels created by a `listen` or `connect` call
#[derive(Clone)]
pub struct ChannelSettings {
    pub options: ChannelOptions,
    pub versions: ProtocolVersions,
    /// TLS for TCP, DTLS for UDP - the identity must be registered with the engine
    pub security_id: Option<SecurityId>,
    /// Creates the application's listener once the handshake completes. Without a factory,
    ///  channels are kept open but messages are dropped.
    pub factory: Option<ListenerFactory>,
    /// For outgoing TCP connections: re-connect after this delay when the connection is lost
    pub reconnect_delay: Option<Duration>,
}

impl ChannelSettings {
    pub fn new(options: ChannelOptions, versions: ProtocolVersions, factory: Option<ListenerFactory>) -> ChannelSettings {
        ChannelSettings {
            options,
            versions,
            security_id: None,
            factory,
            reconnect_delay: None,
        }
    }

    pub fn with_security(mut self, security_id: SecurityId) -> ChannelSettings {
        self.security_id = Some(security_id);
        self
    }

    pub fn with_reconnect(mut self, delay: Duration) -> ChannelSettings {
        self.reconnect_delay = Some(delay);
        self
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.options.validate()?;
        if self.versions.is_empty() {
            bail!("no protocol versions");
        }
        Ok(())
    }
}

impl Debug for ChannelSettings {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSettings")
            .field("options", &self.options)
            .field("versions", &self.versions)
            .field("security_id", &self.security_id)
            .field("factory", &self.factory.is_some())
            .field("reconnect_delay", &self.reconnect_delay)
            .finish()
    }
}


#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// interval for polling connections for keep-alive and for `on_tickle` callbacks
    pub idle_interval: Duration,
    /// time for the OpenFlow handshake, restarted when the features request is sent
    pub handshake_timeout: Duration,
    /// keep-alive for channels that request features, i.e. controllers
    pub controller_keep_alive: Duration,
    /// keep-alive for all other channels
    pub raw_keep_alive: Duration,
    pub max_datagram_size: usize,
    /// path MTU assumed for DTLS, which can not be discovered reliably
    pub dtls_mtu: u32,
}

impl EngineConfig {
    pub fn new() -> EngineConfig {
        EngineConfig {
            idle_interval: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(5),
            controller_keep_alive: Duration::from_secs(10),
            raw_keep_alive: Duration::from_secs(6),
            max_datagram_size: 65535,
            dtls_mtu: 1400,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.idle_interval.is_zero() {
            bail!("idle interval must be positive");
        }
        if self.handshake_timeout.is_zero() {
            bail!("handshake timeout must be positive");
        }
        if self.max_datagram_size < 8 || self.max_datagram_size > 65535 {
            bail!("max datagram size must be between 8 and 65535, was {}", self.max_datagram_size);
        }
        if self.dtls_mtu < 256 {
            bail!("DTLS MTU is too small: {}", self.dtls_mtu);
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::agent(ChannelOptions::DEFAULT_AGENT, true)]
    #[case::controller(ChannelOptions::DEFAULT_CONTROLLER, true)]
    #[case::controller_aux(ChannelOptions::FEATURES_REQ | ChannelOptions::AUXILIARY, true)]
    #[case::controller_udp(ChannelOptions::FEATURES_REQ | ChannelOptions::AUXILIARY | ChannelOptions::LISTEN_UDP, true)]
    #[case::agent_udp(ChannelOptions::CONNECT_UDP, true)]
    #[case::aux_without_features(ChannelOptions::AUXILIARY, false)]
    #[case::udp_without_aux(ChannelOptions::FEATURES_REQ | ChannelOptions::LISTEN_UDP, false)]
    #[case::connect_udp_with_features(ChannelOptions::FEATURES_REQ | ChannelOptions::CONNECT_UDP, false)]
    fn test_channel_options(#[case] options: ChannelOptions, #[case] valid: bool) {
        assert_eq!(options.validate().is_ok(), valid);
    }

    #[test]
    fn test_settings_without_versions() {
        let settings = ChannelSettings::new(ChannelOptions::DEFAULT_AGENT, ProtocolVersions::NONE, None);
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_default_config() {
        let config = EngineConfig::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));

        let config = EngineConfig { max_datagram_size: 4, ..EngineConfig::new() };
        assert!(config.validate().is_err());
    }
}
