//! Host and peer configuration.

use std::net::IpAddr;
use std::time::Duration;

use super::constants::*;
use super::error::NetError;

/// Compression algorithm used for outgoing packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressorKind {
    /// Raw DEFLATE at the fastest level.
    #[default]
    Deflate,
    /// LZF.
    Lzf,
}

/// Network condition simulator settings.
///
/// Each datagram is delayed by `latency + U(-1, 1) * jitter`, never less
/// than zero.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SimulatorConfig {
    /// Probability in `[0, 1]` that an outgoing datagram is dropped.
    pub outgoing_loss: f32,
    /// Base delay added to outgoing datagrams.
    pub outgoing_latency: Duration,
    /// Maximum random deviation from the outgoing latency.
    pub outgoing_jitter: Duration,
    /// Probability in `[0, 1]` that an incoming datagram is dropped.
    pub incoming_loss: f32,
    /// Base delay added to incoming datagrams.
    pub incoming_latency: Duration,
    /// Maximum random deviation from the incoming latency.
    pub incoming_jitter: Duration,
    /// Seed for reproducible runs.
    pub seed: Option<u64>,
}

/// Host configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Port to bind to, 0 for an ephemeral port.
    pub port: u16,

    /// Address to bind to. Defaults to the unspecified address.
    pub bind_address: Option<IpAddr>,

    /// Bind an IPv6 socket that also accepts IPv4 traffic.
    pub dual_mode: bool,

    /// Allow sending broadcasts.
    pub broadcast: bool,

    /// IP time-to-live for outgoing packets.
    pub ttl: u32,

    /// Socket send buffer size.
    pub send_buffer_size: usize,

    /// Socket receive buffer size.
    pub receive_buffer_size: usize,

    /// Number of receive threads.
    pub receive_count: usize,

    /// Largest datagram the receive loop accepts.
    pub receive_mtu: usize,

    /// Attach and verify CRC32 checksums.
    pub crc32: bool,

    /// Compress outgoing packets when it makes them smaller.
    pub compression: bool,

    /// Compressor used for outgoing packets.
    pub compressor: CompressorKind,

    /// Offer ECDH key exchange and encrypt connected traffic.
    pub encryption: bool,

    /// Base64 RSA private key used to answer authentication challenges.
    pub private_key: Option<String>,

    /// Maximum number of buffers kept per pool.
    pub allocator_count: usize,

    /// Largest buffer kept in a pool.
    pub allocator_pooled_length: usize,

    /// Growth step while expanding a buffer below the pooled length.
    pub allocator_pooled_expand_length: usize,

    /// Growth step while expanding a buffer above the pooled length.
    pub allocator_expand_length: usize,

    /// Largest message the host will build or decompress.
    pub allocator_max_length: usize,

    /// Interval of the ticker thread.
    pub tick_interval: Duration,

    /// Capacity of the event queue.
    pub event_queue_capacity: usize,

    /// Network condition simulator, disabled when `None`.
    pub simulator: Option<SimulatorConfig>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            port: 0,
            bind_address: None,
            dual_mode: false,
            broadcast: true,
            ttl: DEFAULT_TTL,
            send_buffer_size: DEFAULT_SEND_BUFFER_SIZE,
            receive_buffer_size: DEFAULT_RECEIVE_BUFFER_SIZE,
            receive_count: DEFAULT_RECEIVE_COUNT,
            receive_mtu: DEFAULT_RECEIVE_MTU,
            crc32: true,
            compression: true,
            compressor: CompressorKind::default(),
            encryption: true,
            private_key: None,
            allocator_count: DEFAULT_ALLOCATOR_COUNT,
            allocator_pooled_length: DEFAULT_ALLOCATOR_POOLED_LENGTH,
            allocator_pooled_expand_length: DEFAULT_ALLOCATOR_POOLED_EXPAND_LENGTH,
            allocator_expand_length: DEFAULT_ALLOCATOR_EXPAND_LENGTH,
            allocator_max_length: DEFAULT_ALLOCATOR_MAX_LENGTH,
            tick_interval: DEFAULT_TICK_INTERVAL,
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            simulator: None,
        }
    }
}

impl HostConfig {
    /// Start building a configuration from the defaults.
    pub fn builder() -> HostConfigBuilder {
        HostConfigBuilder::new()
    }

    /// Check the configuration for values the host cannot run with.
    pub fn validate(&self) -> Result<(), NetError> {
        if self.receive_count == 0 {
            return Err(NetError::Config("receive_count must be at least 1".into()));
        }
        if self.receive_mtu < 64 {
            return Err(NetError::Config(format!(
                "receive_mtu {} is too small",
                self.receive_mtu
            )));
        }
        if self.allocator_pooled_expand_length == 0 || self.allocator_expand_length == 0 {
            return Err(NetError::Config("allocator expand lengths must be non-zero".into()));
        }
        if self.allocator_max_length < self.receive_mtu {
            return Err(NetError::Config(
                "allocator_max_length must be at least receive_mtu".into(),
            ));
        }
        if self.tick_interval.is_zero() {
            return Err(NetError::Config("tick_interval must be non-zero".into()));
        }
        if self.event_queue_capacity == 0 {
            return Err(NetError::Config("event_queue_capacity must be non-zero".into()));
        }
        if let Some(simulator) = &self.simulator {
            let valid = |p: f32| (0.0..=1.0).contains(&p);
            if !valid(simulator.outgoing_loss) || !valid(simulator.incoming_loss) {
                return Err(NetError::Config("simulator loss must be within [0, 1]".into()));
            }
        }
        Ok(())
    }
}

/// Builder for [`HostConfig`].
#[derive(Debug, Default)]
pub struct HostConfigBuilder {
    config: HostConfig,
}

impl HostConfigBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the bind address.
    pub fn bind_address(mut self, address: IpAddr) -> Self {
        self.config.bind_address = Some(address);
        self
    }

    /// Enable or disable dual-mode sockets.
    pub fn dual_mode(mut self, enabled: bool) -> Self {
        self.config.dual_mode = enabled;
        self
    }

    /// Enable or disable broadcast.
    pub fn broadcast(mut self, enabled: bool) -> Self {
        self.config.broadcast = enabled;
        self
    }

    /// Set the number of receive threads.
    pub fn receive_count(mut self, count: usize) -> Self {
        self.config.receive_count = count;
        self
    }

    /// Enable or disable CRC32 checksums.
    pub fn crc32(mut self, enabled: bool) -> Self {
        self.config.crc32 = enabled;
        self
    }

    /// Enable or disable compression.
    pub fn compression(mut self, enabled: bool) -> Self {
        self.config.compression = enabled;
        self
    }

    /// Choose the compressor.
    pub fn compressor(mut self, kind: CompressorKind) -> Self {
        self.config.compressor = kind;
        self
    }

    /// Enable or disable encryption.
    pub fn encryption(mut self, enabled: bool) -> Self {
        self.config.encryption = enabled;
        self
    }

    /// Set the RSA private key used to authenticate this host.
    pub fn private_key(mut self, key: impl Into<String>) -> Self {
        self.config.private_key = Some(key.into());
        self
    }

    /// Set the tick interval.
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval = interval;
        self
    }

    /// Set the event queue capacity.
    pub fn event_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.event_queue_capacity = capacity;
        self
    }

    /// Enable the network condition simulator.
    pub fn simulator(mut self, simulator: SimulatorConfig) -> Self {
        self.config.simulator = Some(simulator);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> HostConfig {
        self.config
    }
}

/// Per-peer protocol configuration.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Connection requests sent before the attempt times out.
    pub connect_attempts: u32,

    /// Delay between connection requests, also the delay before the first ping.
    pub connect_delay: Duration,

    /// Largest datagram this peer produces.
    pub mtu: usize,

    /// Interval between pings.
    pub ping_delay: Duration,

    /// Batching delay before queued messages are flushed.
    pub send_delay: Duration,

    /// Sends of a reliable message before the peer times out.
    pub resend_count: u32,

    /// Added to the RTT to get the resend delay.
    pub resend_delay_jitter: Duration,

    /// Lower bound of the resend delay.
    pub resend_delay_min: Duration,

    /// Upper bound of the resend delay, used until an RTT is known.
    pub resend_delay_max: Duration,

    /// Lifetime of an incomplete fragment group.
    pub fragment_timeout: Duration,

    /// Lifetime of a unique-window entry. Zero disables deduplication.
    pub duplicate_timeout: Duration,

    /// Consecutive unsequenced messages before one is sequenced.
    pub unsequenced_max: u32,

    /// Later deliveries a buffered ordered message waits for. Zero disables buffering.
    pub ordered_delay_max: u32,

    /// Maximum wait of a buffered ordered message. Zero disables buffering.
    pub ordered_delay_timeout: Duration,

    /// Linger after a disconnect so the final messages can be acknowledged.
    pub disconnect_delay: Duration,

    /// Silence after which a connected peer times out.
    pub idle_timeout: Duration,

    /// Weight of the previous clock delta average, in `[0, 1]`. One ignores drift.
    pub time_stability: f64,

    /// Base64 RSA public key the remote host must prove ownership of.
    pub remote_public_key: Option<String>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            connect_delay: DEFAULT_CONNECT_DELAY,
            mtu: DEFAULT_MTU,
            ping_delay: DEFAULT_PING_DELAY,
            send_delay: DEFAULT_SEND_DELAY,
            resend_count: DEFAULT_RESEND_COUNT,
            resend_delay_jitter: DEFAULT_RESEND_DELAY_JITTER,
            resend_delay_min: DEFAULT_RESEND_DELAY_MIN,
            resend_delay_max: DEFAULT_RESEND_DELAY_MAX,
            fragment_timeout: DEFAULT_FRAGMENT_TIMEOUT,
            duplicate_timeout: DEFAULT_DUPLICATE_TIMEOUT,
            unsequenced_max: DEFAULT_UNSEQUENCED_MAX,
            ordered_delay_max: DEFAULT_ORDERED_DELAY_MAX,
            ordered_delay_timeout: DEFAULT_ORDERED_DELAY_TIMEOUT,
            disconnect_delay: DEFAULT_DISCONNECT_DELAY,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            time_stability: DEFAULT_TIME_STABILITY,
            remote_public_key: None,
        }
    }
}

impl PeerConfig {
    /// Start building a configuration from the defaults.
    pub fn builder() -> PeerConfigBuilder {
        PeerConfigBuilder::new()
    }

    /// Check the configuration for values a peer cannot run with.
    pub fn validate(&self) -> Result<(), NetError> {
        // header + crc + ticks + fragment header + at least one IV-prefixed block
        let minimum = 1 + 4 + 2 + 6 + AES_BLOCK_SIZE * 2;
        if self.mtu < minimum {
            return Err(NetError::Config(format!(
                "mtu {} is below the minimum of {minimum}",
                self.mtu
            )));
        }
        if self.connect_attempts == 0 {
            return Err(NetError::Config("connect_attempts must be at least 1".into()));
        }
        if self.resend_count == 0 || self.resend_count > u32::from(u8::MAX) {
            return Err(NetError::Config("resend_count must be within 1..=255".into()));
        }
        if self.resend_delay_min > self.resend_delay_max {
            return Err(NetError::Config(
                "resend_delay_min must not exceed resend_delay_max".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.time_stability) {
            return Err(NetError::Config("time_stability must be within [0, 1]".into()));
        }
        Ok(())
    }

    /// Whether out-of-order reliable messages may be buffered.
    pub fn ordered_delay_enabled(&self) -> bool {
        self.ordered_delay_max > 0 && !self.ordered_delay_timeout.is_zero()
    }
}

/// Builder for [`PeerConfig`].
#[derive(Debug, Default)]
pub struct PeerConfigBuilder {
    config: PeerConfig,
}

impl PeerConfigBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the MTU.
    pub fn mtu(mut self, mtu: usize) -> Self {
        self.config.mtu = mtu;
        self
    }

    /// Set the connect attempts and delay.
    pub fn connect(mut self, attempts: u32, delay: Duration) -> Self {
        self.config.connect_attempts = attempts;
        self.config.connect_delay = delay;
        self
    }

    /// Set the ping delay.
    pub fn ping_delay(mut self, delay: Duration) -> Self {
        self.config.ping_delay = delay;
        self
    }

    /// Set the send delay.
    pub fn send_delay(mut self, delay: Duration) -> Self {
        self.config.send_delay = delay;
        self
    }

    /// Set the resend policy.
    pub fn resend(mut self, count: u32, min: Duration, max: Duration, jitter: Duration) -> Self {
        self.config.resend_count = count;
        self.config.resend_delay_min = min;
        self.config.resend_delay_max = max;
        self.config.resend_delay_jitter = jitter;
        self
    }

    /// Set the fragment timeout.
    pub fn fragment_timeout(mut self, timeout: Duration) -> Self {
        self.config.fragment_timeout = timeout;
        self
    }

    /// Set the duplicate timeout.
    pub fn duplicate_timeout(mut self, timeout: Duration) -> Self {
        self.config.duplicate_timeout = timeout;
        self
    }

    /// Set the ordered delay limits.
    pub fn ordered_delay(mut self, max: u32, timeout: Duration) -> Self {
        self.config.ordered_delay_max = max;
        self.config.ordered_delay_timeout = timeout;
        self
    }

    /// Set the disconnect delay.
    pub fn disconnect_delay(mut self, delay: Duration) -> Self {
        self.config.disconnect_delay = delay;
        self
    }

    /// Set the idle timeout.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Require the remote host to prove ownership of this RSA public key.
    pub fn remote_public_key(mut self, key: impl Into<String>) -> Self {
        self.config.remote_public_key = Some(key.into());
        self
    }

    /// Build the configuration.
    pub fn build(self) -> PeerConfig {
        self.config
    }
}
