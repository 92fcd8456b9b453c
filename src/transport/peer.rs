//! Connection state machine of one remote endpoint.
//!
//! A [`Peer`] never touches the socket or the host's tables. Every entry
//! point takes a [`PeerContext`] holding the current instant, the host clock,
//! the host-wide shared state and an output buffer; datagrams and events the
//! call produces are appended to [`PeerOutput`] for the caller to dispatch
//! once the peer lock is released.
//!
//! Outgoing path: message header + payload, queued and batched into one body
//! per datagram, compressed when that helps, encrypted, framed, then split
//! into fragments when the frame exceeds the MTU.
//!
//! Incoming path: fragments are reassembled, the body is decrypted and
//! decompressed, and each message goes through acknowledgement, duplicate
//! suppression and the ordered cursor of its channel.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::connection::{
    ConnectionState, Direction, DisconnectReason, PeerInfo, PeerState, RequestAction,
};
use super::error::{TransportError, TransportResult};
use super::fragment::{split_fragments, FragmentAssembler};
use super::frame::{
    encode_packet, sizes, write_combined, AcceptPayload, AckPayload, FrameError, MessageFlags,
    MessageHeader, MessageType, Messages, PacketFlags, PacketHeader, PacketType, RequestPayload,
};
use super::reliability::{
    acked_sequences, AckWindow, LossTracker, OrderedChannel, OrderedOutcome, PendingMessage,
    ResendQueue, UniqueWindow,
};
use super::statistics::PeerStatistics;
use super::timing::{ClockDelta, RttEstimator};
use crate::alloc::Allocator;
use crate::compression::{compress_if_smaller, create_compressor, CompressResult, Compressor};
use crate::core::{
    HostClock, HostConfig, HostTimestamp, Message, PeerConfig, Reader, Writer, AES_BLOCK_SIZE,
    CHALLENGE_SIZE, CHANNEL_DISCONNECT, CHANNEL_PING,
};
use crate::crypto::{
    AesSession, CryptoAuthenticator, CryptoEncryptor, CryptoExchanger, CryptoRandom, OsRandom,
    RsaAuthenticator, X25519Exchanger,
};

/// Host-wide state every peer of a host works with.
pub struct PeerShared {
    /// Buffer pools.
    pub allocator: Arc<Allocator>,
    /// Compressor applied to outgoing bodies.
    pub compressor: Arc<dyn Compressor>,
    /// Signs challenges of inbound peers and verifies accepts of outbound ones.
    pub authenticator: Arc<RsaAuthenticator>,
    /// Attach and verify CRC32 checksums.
    pub crc32: bool,
    /// Compress outgoing bodies when it makes them smaller.
    pub compression: bool,
    /// Offer and accept packet encryption.
    pub encryption: bool,
}

impl PeerShared {
    /// Build the shared state described by a host configuration.
    pub fn new(
        config: &HostConfig,
        allocator: Arc<Allocator>,
        authenticator: Arc<RsaAuthenticator>,
    ) -> Self {
        Self {
            compressor: create_compressor(config.compressor, allocator.clone()),
            allocator,
            authenticator,
            crc32: config.crc32,
            compression: config.compression,
            encryption: config.encryption,
        }
    }
}

impl fmt::Debug for PeerShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerShared")
            .field("crc32", &self.crc32)
            .field("compression", &self.compression)
            .field("encryption", &self.encryption)
            .finish_non_exhaustive()
    }
}

/// Datagrams and events produced by one call into a [`Peer`].
#[derive(Debug, Default)]
pub struct PeerOutput {
    /// Encoded datagrams for the peer's remote address. Each is an allocator
    /// packet buffer.
    pub datagrams: Vec<Vec<u8>>,
    /// Events in the order they happened.
    pub events: Vec<PeerEvent>,
}

impl PeerOutput {
    /// Whether the call produced nothing.
    pub fn is_empty(&self) -> bool {
        self.datagrams.is_empty() && self.events.is_empty()
    }
}

/// Everything a peer needs from its host for one call.
pub struct PeerContext<'a> {
    /// Current instant.
    pub now: Instant,
    /// Host clock, for wire ticks and message timestamps.
    pub clock: &'a HostClock,
    /// Host-wide shared state.
    pub shared: &'a PeerShared,
    /// Output of the call.
    pub output: &'a mut PeerOutput,
}

impl PeerContext<'_> {
    fn timestamp(&self) -> HostTimestamp {
        self.clock.timestamp(self.now)
    }

    fn emit(&mut self, event: PeerEvent) {
        self.output.events.push(event);
    }
}

/// Something that happened to a peer.
#[derive(Debug)]
pub enum PeerEvent {
    /// The handshake completed.
    Connected,
    /// A message was delivered.
    Received(ReceivedMessage),
    /// The peer reached `Disconnected`.
    Disconnected {
        /// Why.
        reason: DisconnectReason,
        /// Payload sent by the remote or passed to the local disconnect.
        payload: Vec<u8>,
    },
    /// A packet from the remote was dropped.
    Exception(TransportError),
    /// A new round trip sample was taken.
    RttUpdated(Duration),
    /// A reliable application message was acknowledged.
    Acknowledged {
        /// Channel of the message.
        channel: u8,
        /// Sequence returned by the send.
        sequence: u16,
    },
}

/// An application message delivered by a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Channel.
    pub channel: u8,
    /// Sequence, if the message was sequenced.
    pub sequence: Option<u16>,
    /// Send attempt that got through.
    pub attempt: u8,
    /// Creation time on the local clock. Derived from the sender's ticks for
    /// timed messages once the clock delta is known, otherwise estimated as
    /// half a round trip before arrival.
    pub timestamp: HostTimestamp,
    /// Reliable flag.
    pub reliable: bool,
    /// Ordered flag.
    pub ordered: bool,
    /// Unique flag.
    pub unique: bool,
    /// Timed flag.
    pub timed: bool,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl ReceivedMessage {
    /// Reader over the payload.
    pub fn reader(&self) -> Reader<'_> {
        Reader::new(&self.payload)
    }
}

#[derive(Debug)]
struct ChannelState {
    next_sequence: u16,
    unsequenced: u32,
    acks: AckWindow,
    ordered: OrderedChannel<ReceivedMessage>,
    loss: LossTracker,
}

impl ChannelState {
    fn new(config: &PeerConfig) -> Self {
        Self {
            next_sequence: 0,
            unsequenced: 0,
            acks: AckWindow::new(),
            ordered: OrderedChannel::new(config.ordered_delay_max, config.ordered_delay_timeout),
            loss: LossTracker::default(),
        }
    }

    /// Sequence the next message would get. Unsequenced messages still get
    /// one after `unsequenced_max` in a row so loss stays measurable.
    fn plan(&self, sequenced: bool, unsequenced_max: u32) -> Option<u16> {
        (sequenced || self.unsequenced >= unsequenced_max).then_some(self.next_sequence)
    }

    fn commit(&mut self, sequence: Option<u16>) {
        match sequence {
            Some(_) => {
                self.next_sequence = self.next_sequence.wrapping_add(1);
                self.unsequenced = 0;
            }
            None => self.unsequenced += 1,
        }
    }

    fn take_sequence(&mut self) -> u16 {
        let sequence = self.next_sequence;
        self.commit(Some(sequence));
        sequence
    }
}

#[derive(Debug)]
enum Outgoing {
    Unreliable(Vec<u8>),
    /// Bytes live in the resend queue.
    Reliable { channel: u8, sequence: u16 },
}

/// Allocator message buffer handed back when dropped.
struct Scratch<'a> {
    allocator: &'a Allocator,
    buf: Vec<u8>,
}

impl<'a> Scratch<'a> {
    fn new(allocator: &'a Allocator, buf: Vec<u8>) -> Self {
        Self { allocator, buf }
    }
}

impl Deref for Scratch<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl Drop for Scratch<'_> {
    fn drop(&mut self) {
        self.allocator.return_message(std::mem::take(&mut self.buf));
    }
}

/// One remote endpoint.
pub struct Peer {
    remote: SocketAddr,
    config: PeerConfig,
    connection: ConnectionState,

    exchanger: Option<X25519Exchanger>,
    encryptor: Option<AesSession>,
    authenticated: bool,
    challenge: Vec<u8>,
    /// Encoded request body (outbound) or accept body (inbound).
    handshake: Vec<u8>,
    /// Exchange key sent with our own requests.
    local_key: Vec<u8>,

    rtt: RttEstimator,
    clock_delta: ClockDelta,

    channels: HashMap<u8, ChannelState>,
    unique: UniqueWindow,
    resend: ResendQueue,
    fragments: FragmentAssembler,
    fragment_id: u16,

    queue: Vec<Outgoing>,
    queued_bytes: usize,
    flush_deadline: Option<Instant>,
    ack_pending: bool,

    statistics: PeerStatistics,
    disposed: bool,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("remote", &self.remote)
            .field("state", &self.connection.state())
            .field("direction", &self.connection.direction())
            .field("encrypted", &self.encryptor.is_some())
            .field("in_flight", &self.resend.len())
            .finish_non_exhaustive()
    }
}

impl Peer {
    fn new(
        cx: &PeerContext<'_>,
        remote: SocketAddr,
        config: PeerConfig,
        connection: ConnectionState,
    ) -> Self {
        Self {
            remote,
            fragments: FragmentAssembler::new(cx.shared.allocator.clone(), config.fragment_timeout),
            config,
            connection,
            exchanger: None,
            encryptor: None,
            authenticated: false,
            challenge: Vec::new(),
            handshake: Vec::new(),
            local_key: Vec::new(),
            rtt: RttEstimator::new(),
            clock_delta: ClockDelta::new(),
            channels: HashMap::new(),
            unique: UniqueWindow::new(),
            resend: ResendQueue::new(),
            fragment_id: 0,
            queue: Vec::new(),
            queued_bytes: 0,
            flush_deadline: None,
            ack_pending: false,
            statistics: PeerStatistics::default(),
            disposed: false,
        }
    }

    /// Start connecting to `remote`. The first request is sent right away.
    pub fn connect(
        cx: &mut PeerContext<'_>,
        remote: SocketAddr,
        config: PeerConfig,
        payload: &[u8],
    ) -> TransportResult<Self> {
        let mut peer = Self::new(cx, remote, config, ConnectionState::outbound(cx.now));
        if cx.shared.encryption {
            let exchanger = X25519Exchanger::generate(cx.shared.allocator.clone());
            peer.local_key.extend_from_slice(exchanger.public_key());
            peer.exchanger = Some(exchanger);
        }
        if peer.config.remote_public_key.is_some() {
            let mut challenge = vec![0u8; CHALLENGE_SIZE];
            OsRandom.fill(&mut challenge);
            peer.challenge = challenge;
        }

        let mut writer = Writer::new();
        RequestPayload {
            key: peer.exchanger.as_ref().map_or(&[][..], |e| e.public_key()),
            challenge: &peer.challenge,
            payload,
        }
        .write(&mut writer);
        peer.handshake = writer.into_inner();

        let size = PacketHeader::new(PacketType::Request).encoded_len(cx.shared.crc32)
            + peer.handshake.len();
        if size > peer.config.mtu {
            return Err(TransportError::MessageTooLarge {
                size,
                limit: peer.config.mtu,
            });
        }

        tracing::debug!(%remote, encrypted = peer.exchanger.is_some(), "connecting");
        peer.tick(cx);
        Ok(peer)
    }

    /// Accept a connection request carrying the remote's public `key` and
    /// `challenge`. The peer is connected once the accept is sent.
    pub fn accept(
        cx: &mut PeerContext<'_>,
        remote: SocketAddr,
        config: PeerConfig,
        key: &[u8],
        challenge: &[u8],
    ) -> TransportResult<Self> {
        let mut peer = Self::new(cx, remote, config, ConnectionState::inbound(cx.now));

        // Either side may run without encryption; the connection then falls back to plaintext
        let mut local_key = Vec::new();
        if cx.shared.encryption && !key.is_empty() {
            let exchanger = X25519Exchanger::generate(cx.shared.allocator.clone());
            peer.encryptor = Some(exchanger.derive_encryptor(key)?);
            local_key.extend_from_slice(exchanger.public_key());
        }
        let signature = if !challenge.is_empty() && cx.shared.authenticator.has_private_key() {
            cx.shared.authenticator.sign(challenge)?
        } else {
            Vec::new()
        };

        let mut writer = Writer::new();
        AcceptPayload {
            key: &local_key,
            signature: &signature,
        }
        .write(&mut writer);
        peer.handshake = writer.into_inner();

        Self::emit_packet(
            cx,
            &mut peer.statistics,
            &PacketHeader::new(PacketType::Accept),
            &peer.handshake,
        );
        peer.connection.establish(cx.now, &peer.config);
        tracing::debug!(%remote, encrypted = peer.encryptor.is_some(), "accepted");
        cx.emit(PeerEvent::Connected);
        Ok(peer)
    }

    /// Remote address.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Peer configuration.
    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// Connection state.
    pub fn state(&self) -> PeerState {
        self.connection.state()
    }

    /// Whether messages can be sent.
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Whether the peer is finished and can be removed.
    pub fn is_disconnected(&self) -> bool {
        self.connection.is_disconnected()
    }

    /// Smoothed round trip time.
    pub fn rtt(&self) -> Option<Duration> {
        self.rtt.rtt()
    }

    /// Traffic counters.
    pub fn statistics(&self) -> &PeerStatistics {
        &self.statistics
    }

    /// Reliable messages waiting for an acknowledgement.
    pub fn in_flight(&self) -> usize {
        self.resend.len()
    }

    /// Snapshot of the peer.
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            remote: self.remote,
            state: self.connection.state(),
            direction: self.connection.direction(),
            rtt: self.rtt.rtt(),
            clock_delta: self
                .clock_delta
                .is_known()
                .then(|| self.clock_delta.average()),
            encrypted: self.encryptor.is_some(),
            authenticated: self.authenticated,
            statistics: self.statistics,
        }
    }

    // ---------------------------------------------------------------------
    // Sending
    // ---------------------------------------------------------------------

    /// Queue an application message. Returns its sequence if it got one.
    pub fn send<M: Message + ?Sized>(
        &mut self,
        cx: &mut PeerContext<'_>,
        message: &M,
    ) -> TransportResult<Option<u16>> {
        if !self.connection.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let channel = message.channel();
        let (reliable, ordered, unique) = (message.reliable(), message.ordered(), message.unique());
        let unsequenced_max = self.config.unsequenced_max;
        let sequence = self
            .channel(channel)
            .plan(reliable || ordered || unique, unsequenced_max);

        let flags = MessageFlags::NONE
            .with_if(MessageFlags::RELIABLE, reliable)
            .with_if(MessageFlags::ORDERED, ordered)
            .with_if(MessageFlags::UNIQUE, unique);
        let mut header = MessageHeader::new(MessageType::Custom, flags);
        header.channel = channel;
        header.sequence = sequence;
        if message.timed() {
            let timestamp = message.timestamp().unwrap_or_else(|| cx.timestamp());
            header.ticks = Some(timestamp.slice());
        }

        let mut writer = Writer::from_vec(cx.shared.allocator.create_message(0));
        header.write(&mut writer);
        message.write(&mut writer);
        self.enqueue(cx, header, writer.into_inner())?;
        self.channel(channel).commit(sequence);
        self.schedule_flush(cx);
        Ok(sequence)
    }

    fn channel(&mut self, channel: u8) -> &mut ChannelState {
        let config = &self.config;
        self.channels
            .entry(channel)
            .or_insert_with(|| ChannelState::new(config))
    }

    fn enqueue(
        &mut self,
        cx: &mut PeerContext<'_>,
        header: MessageHeader,
        bytes: Vec<u8>,
    ) -> TransportResult<()> {
        let limit = cx.shared.allocator.max_length();
        if bytes.len() > limit {
            let size = bytes.len();
            cx.shared.allocator.return_message(bytes);
            return Err(TransportError::MessageTooLarge { size, limit });
        }

        let stats = &mut self.statistics;
        stats.message_send_bytes += bytes.len() as u64;
        stats.message_send_total += 1;
        match header.message_type {
            MessageType::Acknowledge => stats.message_send_acknowledge += 1,
            MessageType::Ping => stats.message_send_ping += 1,
            _ => {}
        }
        if header.is_reliable() {
            stats.message_send_reliable += 1;
        } else {
            stats.message_send_unreliable += 1;
        }

        self.queued_bytes += sizes::COMBINED_PREFIX_SIZE + bytes.len();
        match (header.sequence, header.attempt_offset()) {
            (Some(sequence), Some(offset)) => {
                let pending = PendingMessage::new(
                    header.message_type,
                    header.channel,
                    sequence,
                    bytes,
                    offset,
                );
                if let Some(stale) = self.resend.insert(pending) {
                    cx.shared.allocator.return_message(stale.bytes);
                }
                self.queue.push(Outgoing::Reliable {
                    channel: header.channel,
                    sequence,
                });
            }
            _ => self.queue.push(Outgoing::Unreliable(bytes)),
        }
        Ok(())
    }

    /// Queue a reliable control message on `channel`.
    fn send_control(
        &mut self,
        cx: &mut PeerContext<'_>,
        message_type: MessageType,
        channel: u8,
        payload: &[u8],
    ) -> TransportResult<()> {
        let mut header = MessageHeader::new(message_type, MessageFlags::RELIABLE);
        header.channel = channel;
        header.sequence = Some(self.channel(channel).take_sequence());
        header.ticks = Some(cx.timestamp().slice());

        let mut writer = Writer::from_vec(cx.shared.allocator.create_message(0));
        header.write(&mut writer);
        writer.write_bytes(payload);
        self.enqueue(cx, header, writer.into_inner())
    }

    fn send_ping(&mut self, cx: &mut PeerContext<'_>) {
        match self.send_control(cx, MessageType::Ping, CHANNEL_PING, &[]) {
            Ok(()) => self.flush(cx),
            Err(error) => self.report(cx, error),
        }
    }

    fn queue_ack(&mut self, cx: &mut PeerContext<'_>, channel: u8, sequence: u16, attempt: u8) {
        let state = self.channel(channel);
        state.acks.record(sequence);
        let (latest, mask) = state.acks.fields().unwrap_or((sequence, 0));

        let mut header = MessageHeader::new(MessageType::Acknowledge, MessageFlags::NONE);
        header.channel = channel;
        header.sequence = Some(sequence);
        header.ticks = Some(cx.timestamp().slice());

        let mut writer = Writer::from_vec(cx.shared.allocator.create_message(0));
        header.write(&mut writer);
        AckPayload {
            attempt,
            latest,
            mask,
        }
        .write(&mut writer);
        if let Err(error) = self.enqueue(cx, header, writer.into_inner()) {
            self.report(cx, error);
        }
        self.ack_pending = true;
    }

    /// Largest body that fits in one datagram after encryption and framing.
    fn batch_limit(&self) -> usize {
        let overhead = sizes::HEADER_SIZE
            + sizes::CRC_SIZE
            + sizes::TICKS_SIZE
            + if self.encryptor.is_some() {
                2 * AES_BLOCK_SIZE
            } else {
                0
            };
        self.config.mtu.saturating_sub(overhead).max(1)
    }

    fn schedule_flush(&mut self, cx: &mut PeerContext<'_>) {
        if self.config.send_delay.is_zero() || self.queued_bytes >= self.batch_limit() {
            self.flush(cx);
        } else if self.flush_deadline.is_none() {
            self.flush_deadline = Some(cx.now + self.config.send_delay);
        }
    }

    /// Send everything queued, combining messages up to the batch limit.
    fn flush(&mut self, cx: &mut PeerContext<'_>) {
        self.flush_deadline = None;
        self.queued_bytes = 0;
        if self.queue.is_empty() {
            return;
        }

        let limit = self.batch_limit();
        let queue = std::mem::take(&mut self.queue);
        let mut batch = Vec::new();
        let mut batch_len = 0;
        for item in queue {
            let len = match &item {
                Outgoing::Unreliable(bytes) => bytes.len(),
                Outgoing::Reliable { channel, sequence } => {
                    match self.resend.get(*channel, *sequence) {
                        Some(entry) => entry.bytes.len(),
                        None => continue,
                    }
                }
            };
            let len = sizes::COMBINED_PREFIX_SIZE + len;
            if !batch.is_empty() && batch_len + len > limit {
                self.send_batch(cx, std::mem::take(&mut batch));
                batch_len = 0;
            }
            batch_len += len;
            batch.push(item);
        }
        if !batch.is_empty() {
            self.send_batch(cx, batch);
        }
    }

    fn send_batch(&mut self, cx: &mut PeerContext<'_>, batch: Vec<Outgoing>) {
        let shared = cx.shared;
        let combined = batch.len() > 1;
        let mut body = Scratch::new(&shared.allocator, shared.allocator.create_message(0));
        for item in &batch {
            let bytes = match item {
                Outgoing::Unreliable(bytes) => bytes.as_slice(),
                Outgoing::Reliable { channel, sequence } => {
                    match self.resend.get(*channel, *sequence) {
                        Some(entry) => entry.bytes.as_slice(),
                        None => continue,
                    }
                }
            };
            if combined {
                write_combined(&mut body.buf, bytes);
            } else {
                body.buf.extend_from_slice(bytes);
            }
        }

        let flags = if combined {
            PacketFlags::COMBINED
        } else {
            PacketFlags::NONE
        };
        self.send_body(cx, &body, flags);

        let delay = self.rtt.resend_delay(&self.config);
        for item in batch {
            match item {
                Outgoing::Unreliable(bytes) => shared.allocator.return_message(bytes),
                Outgoing::Reliable { channel, sequence } => {
                    self.resend.mark_sent(channel, sequence, cx.now, delay);
                }
            }
        }
    }

    /// Compress, encrypt, frame and fragment one body.
    fn send_body(&mut self, cx: &mut PeerContext<'_>, body: &[u8], mut flags: PacketFlags) {
        let shared = cx.shared;
        let allocator = &*shared.allocator;

        let mut compressed = None;
        if shared.compression {
            let mut out = Scratch::new(allocator, allocator.create_message(0));
            let result = compress_if_smaller(shared.compressor.as_ref(), body, &mut out.buf);
            self.statistics.compression.record(body.len(), result);
            if let CompressResult::Compressed(len) = result {
                out.buf.truncate(len);
                flags = flags.with(PacketFlags::COMPRESSED);
                compressed = Some(out);
            }
        }
        let body = compressed.as_deref().unwrap_or(body);

        let mut encrypted = None;
        if let Some(encryptor) = self.encryptor.as_mut() {
            let mut out = Scratch::new(allocator, allocator.create_message(0));
            match encryptor.encrypt(body, &mut out.buf) {
                Ok(len) => {
                    out.buf.truncate(len);
                    encrypted = Some(out);
                }
                Err(error) => {
                    tracing::warn!(remote = %self.remote, %error, "encryption failed");
                    cx.emit(PeerEvent::Exception(error.into()));
                    return;
                }
            }
        }
        let body = encrypted.as_deref().unwrap_or(body);

        let header = PacketHeader::new(PacketType::Connected)
            .with_flags(flags)
            .with_ticks(cx.timestamp().slice());
        if header.encoded_len(shared.crc32) + body.len() <= self.config.mtu {
            Self::emit_packet(cx, &mut self.statistics, &header, body);
            return;
        }

        let id = self.fragment_id;
        self.fragment_id = self.fragment_id.wrapping_add(1);
        let chunk = self.config.mtu.saturating_sub(
            sizes::HEADER_SIZE
                + if shared.crc32 { sizes::CRC_SIZE } else { 0 }
                + sizes::TICKS_SIZE
                + sizes::FRAGMENT_HEADER_SIZE,
        );
        match split_fragments(id, body, chunk) {
            Ok(fragments) => {
                for (fragment, part) in fragments {
                    let header = PacketHeader {
                        fragment: Some(fragment),
                        ..header
                    };
                    Self::emit_packet(cx, &mut self.statistics, &header, part);
                }
            }
            Err(error) => self.report(cx, error.into()),
        }
    }

    fn emit_packet(
        cx: &mut PeerContext<'_>,
        statistics: &mut PeerStatistics,
        header: &PacketHeader,
        body: &[u8],
    ) {
        let mut packet = cx.shared.allocator.create_packet(0);
        encode_packet(header, body, cx.shared.crc32, &mut packet);
        statistics.record_packet_sent(cx.timestamp(), packet.len());
        cx.output.datagrams.push(packet);
    }

    // ---------------------------------------------------------------------
    // Receiving
    // ---------------------------------------------------------------------

    /// Handle a datagram from the remote whose header was already decoded.
    pub fn receive_packet(&mut self, cx: &mut PeerContext<'_>, header: PacketHeader, body: &[u8]) {
        if self.connection.is_disconnected() {
            return;
        }
        self.connection.on_receive(cx.now);
        let size = header.encoded_len(cx.shared.crc32) + body.len();
        self.statistics.record_packet_received(cx.timestamp(), size);

        match header.packet_type {
            PacketType::Request => self.receive_request(cx, body),
            PacketType::Accept => self.receive_accept(cx, body),
            PacketType::Reject => self.receive_reject(cx, body),
            PacketType::Connected => self.receive_connected(cx, &header, body),
            other => tracing::trace!(remote = %self.remote, %other, "ignored packet"),
        }

        if self.ack_pending {
            self.ack_pending = false;
            if !self.connection.is_disconnected() {
                self.flush(cx);
            }
        }
        self.poll_linger(cx);
    }

    fn receive_request(&mut self, cx: &mut PeerContext<'_>, body: &[u8]) {
        match self.connection.direction() {
            // Our accept got lost
            Direction::Inbound if !self.handshake.is_empty() => {
                tracing::trace!(remote = %self.remote, "repeating accept");
                Self::emit_packet(
                    cx,
                    &mut self.statistics,
                    &PacketHeader::new(PacketType::Accept),
                    &self.handshake,
                );
            }
            Direction::Inbound => {}
            Direction::Outbound => self.answer_crossed_request(cx, body),
        }
    }

    /// Both hosts connected to each other at once. Answer the remote's
    /// request with an accept built from our own connect key.
    fn answer_crossed_request(&mut self, cx: &mut PeerContext<'_>, body: &[u8]) {
        if self.statistics.message_receive_total > 0 {
            // Messages already flowed, a request now can only be spoofed
            return self.report(cx, TransportError::UnexpectedPacket("late request"));
        }
        let request = match RequestPayload::read(body) {
            Ok(request) => request,
            Err(error) => return self.report(cx, error.into()),
        };
        let connecting = self.connection.state() == PeerState::Connecting;

        if connecting && self.encryptor.is_none() && !request.key.is_empty() {
            if let Some(exchanger) = &self.exchanger {
                match exchanger.derive_encryptor(request.key) {
                    Ok(encryptor) => self.encryptor = Some(encryptor),
                    Err(error) => return self.report(cx, error.into()),
                }
            }
        }
        let key = if self.encryptor.is_some() && !request.key.is_empty() {
            &self.local_key[..]
        } else {
            &[][..]
        };
        let signature =
            if !request.challenge.is_empty() && cx.shared.authenticator.has_private_key() {
                match cx.shared.authenticator.sign(request.challenge) {
                    Ok(signature) => signature,
                    Err(error) => return self.report(cx, error.into()),
                }
            } else {
                Vec::new()
            };

        let mut writer = Writer::new();
        AcceptPayload {
            key,
            signature: &signature,
        }
        .write(&mut writer);
        tracing::debug!(remote = %self.remote, "answering crossed request");
        Self::emit_packet(
            cx,
            &mut self.statistics,
            &PacketHeader::new(PacketType::Accept),
            writer.as_slice(),
        );

        // A remote we must authenticate still owes us a signed accept
        if connecting && self.config.remote_public_key.is_none() {
            self.complete_handshake(cx);
        }
    }

    fn receive_accept(&mut self, cx: &mut PeerContext<'_>, body: &[u8]) {
        if self.connection.state() != PeerState::Connecting
            || self.connection.direction() != Direction::Outbound
        {
            return;
        }
        let accept = match AcceptPayload::read(body) {
            Ok(accept) => accept,
            Err(error) => return self.report(cx, error.into()),
        };

        if let Some(exchanger) = &self.exchanger {
            if !accept.key.is_empty() {
                match exchanger.derive_encryptor(accept.key) {
                    Ok(encryptor) => self.encryptor = Some(encryptor),
                    Err(error) => return self.report(cx, error.into()),
                }
            }
        }

        if let Some(public_key) = &self.config.remote_public_key {
            let verified = !accept.signature.is_empty()
                && cx
                    .shared
                    .authenticator
                    .verify(&self.challenge, accept.signature, public_key)
                    .is_ok();
            if !verified {
                tracing::warn!(remote = %self.remote, "accept signature rejected");
                return self.terminate(cx, DisconnectReason::BadSignature, Vec::new());
            }
            self.authenticated = true;
        }

        self.complete_handshake(cx);
    }

    fn complete_handshake(&mut self, cx: &mut PeerContext<'_>) {
        self.exchanger = None;
        self.challenge = Vec::new();
        self.handshake = Vec::new();
        self.connection.establish(cx.now, &self.config);
        tracing::debug!(
            remote = %self.remote,
            encrypted = self.encryptor.is_some(),
            authenticated = self.authenticated,
            "connected"
        );
        cx.emit(PeerEvent::Connected);
    }

    fn receive_reject(&mut self, cx: &mut PeerContext<'_>, body: &[u8]) {
        if self.connection.state() == PeerState::Connecting
            && self.connection.direction() == Direction::Outbound
        {
            tracing::debug!(remote = %self.remote, "connection rejected");
            self.terminate(cx, DisconnectReason::Rejected, body.to_vec());
        }
    }

    fn receive_connected(&mut self, cx: &mut PeerContext<'_>, header: &PacketHeader, body: &[u8]) {
        if !matches!(
            self.connection.state(),
            PeerState::Connected | PeerState::Disconnecting
        ) {
            tracing::trace!(remote = %self.remote, "connected packet before handshake");
            return;
        }
        let shared = cx.shared;
        let allocator = &*shared.allocator;

        let assembled = match header.fragment {
            Some(fragment) => match self.fragments.insert(cx.now, fragment, body) {
                Ok(Some(body)) => Some(Scratch::new(allocator, body)),
                Ok(None) => return,
                Err(error) => return self.report(cx, error.into()),
            },
            None => None,
        };
        let body = assembled.as_deref().unwrap_or(body);

        let mut decrypted = None;
        if let Some(encryptor) = &self.encryptor {
            let mut out = Scratch::new(allocator, allocator.create_message(0));
            match encryptor.decrypt(body, &mut out.buf) {
                Ok(len) => {
                    out.buf.truncate(len);
                    decrypted = Some(out);
                }
                Err(error) => return self.report(cx, error.into()),
            }
        }
        let body = decrypted.as_deref().unwrap_or(body);

        let mut decompressed = None;
        if header.flags.contains(PacketFlags::COMPRESSED) {
            let mut out = Scratch::new(allocator, allocator.create_message(0));
            match shared.compressor.decompress(body, &mut out.buf) {
                Ok(len) => {
                    out.buf.truncate(len);
                    decompressed = Some(out);
                }
                Err(error) => return self.report(cx, error.into()),
            }
        }
        let body = decompressed.as_deref().unwrap_or(body);

        for message in Messages::new(body, header.flags.contains(PacketFlags::COMBINED)) {
            let result = message
                .map_err(TransportError::from)
                .and_then(|bytes| self.receive_message(cx, header.ticks, bytes));
            if let Err(error) = result {
                self.report(cx, error);
            }
            if self.connection.is_disconnected() {
                break;
            }
        }
    }

    fn receive_message(
        &mut self,
        cx: &mut PeerContext<'_>,
        packet_ticks: Option<u16>,
        bytes: &[u8],
    ) -> TransportResult<()> {
        let mut reader = Reader::new(bytes);
        let header = MessageHeader::read(&mut reader)?;
        let payload = reader.remaining_bytes();

        self.statistics.message_receive_bytes += bytes.len() as u64;
        self.statistics.message_receive_total += 1;
        if header.message_type == MessageType::Acknowledge {
            self.statistics.message_receive_acknowledge += 1;
            return self.receive_ack(cx, packet_ticks, &header, payload);
        }
        if header.is_reliable() {
            self.statistics.message_receive_reliable += 1;
        } else {
            self.statistics.message_receive_unreliable += 1;
        }

        let channel = header.channel;
        if let Some(sequence) = header.sequence {
            // Duplicates are acknowledged too, the first ack may have been lost
            if header.is_reliable() {
                self.queue_ack(cx, channel, sequence, header.attempt);
            }
            if header.is_unique()
                && !self
                    .unique
                    .check(cx.now, channel, sequence, self.config.duplicate_timeout)
            {
                self.statistics.message_receive_duplicated += 1;
                tracing::trace!(remote = %self.remote, channel, sequence, "duplicate dropped");
                return Ok(());
            }
            let lost = self.channel(channel).loss.record(sequence);
            let stats = &mut self.statistics;
            if lost >= 0 {
                stats.message_receive_lost += lost as u64;
            } else {
                stats.message_receive_lost = stats.message_receive_lost.saturating_sub(1);
            }
        }

        match header.message_type {
            MessageType::Custom => self.receive_custom(cx, &header, payload),
            MessageType::Ping => {
                self.statistics.message_receive_ping += 1;
                self.pass_ordered(cx, &header);
            }
            MessageType::Disconnect => {
                self.pass_ordered(cx, &header);
                if self.connection.is_connected() {
                    tracing::debug!(remote = %self.remote, "remote disconnected");
                    self.connection.linger(
                        cx.now,
                        self.config.disconnect_delay,
                        DisconnectReason::Terminated,
                        payload.to_vec(),
                    );
                }
            }
            MessageType::Acknowledge => {}
        }
        Ok(())
    }

    fn receive_custom(&mut self, cx: &mut PeerContext<'_>, header: &MessageHeader, payload: &[u8]) {
        let message = ReceivedMessage {
            channel: header.channel,
            sequence: header.sequence,
            attempt: header.attempt,
            timestamp: self.message_timestamp(cx, header.ticks),
            reliable: header.is_reliable(),
            ordered: header.is_ordered(),
            unique: header.is_unique(),
            timed: header.is_timed(),
            payload: payload.to_vec(),
        };

        let now = cx.now;
        let mut out = Vec::new();
        match header.sequence {
            Some(sequence) if header.is_ordered() => {
                let outcome = self.channel(header.channel).ordered.receive(
                    now,
                    sequence,
                    header.is_reliable(),
                    message,
                    &mut out,
                );
                if outcome == OrderedOutcome::Late {
                    tracing::trace!(
                        remote = %self.remote,
                        channel = header.channel,
                        sequence,
                        "late ordered message dropped"
                    );
                }
            }
            Some(sequence) => {
                self.channel(header.channel)
                    .ordered
                    .pass(now, sequence, header.is_reliable(), &mut out);
                out.push(message);
            }
            None => out.push(message),
        }
        Self::deliver(cx, out);
    }

    /// Move the channel cursor over a sequenced message that is not ordered.
    fn pass_ordered(&mut self, cx: &mut PeerContext<'_>, header: &MessageHeader) {
        if let Some(sequence) = header.sequence {
            let mut out = Vec::new();
            self.channel(header.channel)
                .ordered
                .pass(cx.now, sequence, header.is_reliable(), &mut out);
            Self::deliver(cx, out);
        }
    }

    fn deliver(cx: &mut PeerContext<'_>, messages: Vec<ReceivedMessage>) {
        cx.output
            .events
            .extend(messages.into_iter().map(PeerEvent::Received));
    }

    fn message_timestamp(&self, cx: &PeerContext<'_>, ticks: Option<u16>) -> HostTimestamp {
        let now = cx.timestamp();
        match ticks {
            Some(created) if self.clock_delta.is_known() => HostTimestamp::from_slice(
                created.wrapping_add(self.clock_delta.average()),
                now,
            ),
            _ => HostTimestamp(now.ticks() - i64::from(self.rtt.rtt_ms() / 2)),
        }
    }

    fn receive_ack(
        &mut self,
        cx: &mut PeerContext<'_>,
        packet_ticks: Option<u16>,
        header: &MessageHeader,
        payload: &[u8],
    ) -> TransportResult<()> {
        let sequence = header.sequence.ok_or(FrameError::MissingSequence)?;
        let ack = AckPayload::read(payload)?;
        let channel = header.channel;

        if let Some(entry) = self.resend.acknowledge(channel, sequence) {
            if entry.message_type == MessageType::Ping && entry.attempt == ack.attempt {
                if let (Some(sent), Some(ack_ticks), Some(packet_ticks)) =
                    (entry.last_sent, header.ticks, packet_ticks)
                {
                    self.sample_rtt(cx, sent, ack_ticks, packet_ticks);
                }
            }
            self.acknowledged(cx, entry);
        }
        for sequence in acked_sequences(ack.latest, ack.mask) {
            if let Some(entry) = self.resend.acknowledge(channel, sequence) {
                self.acknowledged(cx, entry);
            }
        }
        Ok(())
    }

    fn acknowledged(&mut self, cx: &mut PeerContext<'_>, entry: PendingMessage) {
        if entry.message_type == MessageType::Custom {
            cx.emit(PeerEvent::Acknowledged {
                channel: entry.channel,
                sequence: entry.sequence,
            });
        }
        cx.shared.allocator.return_message(entry.bytes);
    }

    /// `ack_ticks` is when the remote wrote the ack, `packet_ticks` when it
    /// sent the packet carrying it; the difference is time spent queued.
    fn sample_rtt(&mut self, cx: &mut PeerContext<'_>, sent: Instant, ack_ticks: u16, packet_ticks: u16) {
        let processing = Duration::from_millis(u64::from(packet_ticks.wrapping_sub(ack_ticks)));
        let elapsed = cx.now.saturating_duration_since(sent);
        let Some(sample) = RttEstimator::sample(elapsed, processing) else {
            return;
        };
        self.rtt.update(sample);

        let now = cx.timestamp();
        let half = (sample.as_millis() / 2).min(u128::from(u16::MAX)) as u16;
        let remote = packet_ticks.wrapping_add(half);
        self.clock_delta.update(
            now.slice().wrapping_sub(remote),
            now.ticks(),
            self.config.time_stability,
        );
        tracing::trace!(remote = %self.remote, rtt = ?sample, "rtt sample");
        cx.emit(PeerEvent::RttUpdated(sample));
    }

    // ---------------------------------------------------------------------
    // Timers and teardown
    // ---------------------------------------------------------------------

    /// Drive timers: handshake retries, pings, resends, sweeps and batching.
    pub fn tick(&mut self, cx: &mut PeerContext<'_>) {
        if self.connection.is_disconnected() {
            return;
        }
        let now = cx.now;

        match self.connection.state() {
            PeerState::Connecting => match self.connection.poll_request(now, &self.config) {
                RequestAction::Send => Self::emit_packet(
                    cx,
                    &mut self.statistics,
                    &PacketHeader::new(PacketType::Request),
                    &self.handshake,
                ),
                RequestAction::Exhausted => {
                    tracing::debug!(
                        remote = %self.remote,
                        attempts = self.connection.requests_sent(),
                        "connect timed out"
                    );
                    return self.terminate(cx, DisconnectReason::Timeout, Vec::new());
                }
                RequestAction::Wait => {}
            },
            PeerState::Connected => {
                if self.connection.is_idle(now, &self.config) {
                    tracing::debug!(remote = %self.remote, "idle timeout");
                    return self.terminate(cx, DisconnectReason::Timeout, Vec::new());
                }
                if self.connection.poll_ping(now, &self.config) {
                    self.send_ping(cx);
                }
            }
            PeerState::Disconnecting | PeerState::Disconnected => {}
        }

        let mut resent = false;
        for (channel, sequence) in self.resend.due(now) {
            let Some(entry) = self.resend.get(channel, sequence) else {
                continue;
            };
            if u32::from(entry.attempt) + 1 >= self.config.resend_count {
                tracing::warn!(
                    remote = %self.remote,
                    channel,
                    sequence,
                    attempts = u32::from(entry.attempt) + 1,
                    "reliable message not acknowledged"
                );
                return self.terminate(cx, DisconnectReason::Timeout, Vec::new());
            }
            if self.resend.next_attempt(channel, sequence).is_some() {
                self.statistics.message_send_duplicated += 1;
                self.queue.push(Outgoing::Reliable { channel, sequence });
                resent = true;
            }
        }

        self.fragments.sweep(now);
        self.unique.sweep(now);
        let mut released = Vec::new();
        for state in self.channels.values_mut() {
            state.ordered.sweep(now, &mut released);
        }
        Self::deliver(cx, released);

        if resent || self.flush_deadline.is_some_and(|deadline| now >= deadline) {
            self.flush(cx);
        }
        self.poll_linger(cx);
    }

    /// Close the connection, telling the remote if it was established.
    pub fn disconnect(&mut self, cx: &mut PeerContext<'_>, payload: &[u8]) {
        match self.connection.state() {
            PeerState::Connecting => {
                self.terminate(cx, DisconnectReason::Disconnected, payload.to_vec())
            }
            PeerState::Connected => {
                if let Err(error) =
                    self.send_control(cx, MessageType::Disconnect, CHANNEL_DISCONNECT, payload)
                {
                    self.report(cx, error);
                }
                self.flush(cx);
                tracing::debug!(remote = %self.remote, "disconnecting");
                self.connection.linger(
                    cx.now,
                    self.config.disconnect_delay,
                    DisconnectReason::Disconnected,
                    payload.to_vec(),
                );
                self.poll_linger(cx);
            }
            PeerState::Disconnecting | PeerState::Disconnected => {}
        }
    }

    /// Drop the peer without telling the remote. Safe to call twice.
    pub fn dispose(&mut self, cx: &mut PeerContext<'_>) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        if !self.connection.is_disconnected() {
            self.connection.close();
            cx.emit(PeerEvent::Disconnected {
                reason: DisconnectReason::Disposed,
                payload: Vec::new(),
            });
        }
        self.release(cx.shared);
    }

    fn poll_linger(&mut self, cx: &mut PeerContext<'_>) {
        if let Some((reason, payload)) = self.connection.poll_linger(cx.now) {
            tracing::debug!(remote = %self.remote, %reason, "peer disconnected");
            cx.emit(PeerEvent::Disconnected { reason, payload });
            self.release(cx.shared);
        }
    }

    fn terminate(&mut self, cx: &mut PeerContext<'_>, reason: DisconnectReason, payload: Vec<u8>) {
        if self.connection.is_disconnected() {
            return;
        }
        tracing::debug!(remote = %self.remote, %reason, "peer disconnected");
        self.connection.close();
        cx.emit(PeerEvent::Disconnected { reason, payload });
        self.release(cx.shared);
    }

    /// Hand every pooled buffer back.
    fn release(&mut self, shared: &PeerShared) {
        for entry in self.resend.drain() {
            shared.allocator.return_message(entry.bytes);
        }
        for item in self.queue.drain(..) {
            if let Outgoing::Unreliable(bytes) = item {
                shared.allocator.return_message(bytes);
            }
        }
        self.queued_bytes = 0;
        self.flush_deadline = None;
        self.fragments.clear();
        for state in self.channels.values_mut() {
            state.ordered.clear().for_each(drop);
        }
        self.exchanger = None;
        self.encryptor = None;
    }

    fn report(&self, cx: &mut PeerContext<'_>, error: TransportError) {
        if error.is_protocol_violation() {
            tracing::debug!(remote = %self.remote, %error, "dropped packet");
            cx.emit(PeerEvent::Exception(error));
        } else {
            tracing::trace!(remote = %self.remote, %error, "ignored");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BytesMessage, CompressorKind, RSA_MODULUS_SIZE};
    use crate::transport::frame::decode_packet;
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};

    struct Link {
        clock: HostClock,
        now: Instant,
        shared: PeerShared,
    }

    impl Link {
        fn new(config: &HostConfig) -> Self {
            let now = Instant::now();
            Self {
                clock: HostClock::with_origin(now),
                now,
                shared: PeerShared::new(
                    config,
                    Arc::new(Allocator::default()),
                    Arc::new(RsaAuthenticator::new()),
                ),
            }
        }

        fn run<R>(&self, f: impl FnOnce(&mut PeerContext<'_>) -> R) -> (R, PeerOutput) {
            let mut output = PeerOutput::default();
            let mut cx = PeerContext {
                now: self.now,
                clock: &self.clock,
                shared: &self.shared,
                output: &mut output,
            };
            let result = f(&mut cx);
            (result, output)
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn peer_config() -> PeerConfig {
        PeerConfig {
            send_delay: Duration::ZERO,
            ..PeerConfig::default()
        }
    }

    fn host_config() -> HostConfig {
        HostConfig {
            compression: true,
            compressor: CompressorKind::Lzf,
            encryption: true,
            crc32: true,
            ..HostConfig::default()
        }
    }

    fn deliver(link: &Link, peer: &mut Peer, datagrams: Vec<Vec<u8>>) -> PeerOutput {
        let mut merged = PeerOutput::default();
        for datagram in datagrams {
            let (header, body) = decode_packet(&datagram).unwrap();
            let ((), output) = link.run(|cx| peer.receive_packet(cx, header, body));
            merged.datagrams.extend(output.datagrams);
            merged.events.extend(output.events);
        }
        merged
    }

    /// Run the handshake; returns (client, server).
    fn connected_pair(link: &Link) -> (Peer, Peer) {
        connected_pair_with(link, peer_config())
    }

    fn connected_pair_with(link: &Link, config: PeerConfig) -> (Peer, Peer) {
        let (client, output) = link.run(|cx| Peer::connect(cx, addr(2), config.clone(), b"hi"));
        let mut client = client.unwrap();
        assert_eq!(output.datagrams.len(), 1);

        let (header, body) = decode_packet(&output.datagrams[0]).unwrap();
        assert_eq!(header.packet_type, PacketType::Request);
        let request = RequestPayload::read(body).unwrap();
        assert_eq!(request.payload, b"hi");

        let (server, accept) = link.run(|cx| {
            Peer::accept(cx, addr(1), config, request.key, request.challenge)
        });
        let server = server.unwrap();
        assert!(matches!(accept.events[..], [PeerEvent::Connected]));

        let output = deliver(link, &mut client, accept.datagrams);
        assert!(matches!(output.events[..], [PeerEvent::Connected]));
        (client, server)
    }

    fn received(output: &PeerOutput) -> Vec<Vec<u8>> {
        output
            .events
            .iter()
            .filter_map(|event| match event {
                PeerEvent::Received(message) => Some(message.payload.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_handshake_encrypts() {
        let link = Link::new(&host_config());
        let (client, server) = connected_pair(&link);
        assert!(client.info().encrypted);
        assert!(server.info().encrypted);
        assert_eq!(client.state(), PeerState::Connected);
        assert_eq!(server.info().direction, Direction::Inbound);
    }

    #[test]
    fn test_send_before_connected() {
        let link = Link::new(&host_config());
        let (client, _) = link.run(|cx| Peer::connect(cx, addr(2), peer_config(), &[]));
        let mut client = client.unwrap();
        let (result, _) = link.run(|cx| client.send(cx, &BytesMessage::new(0, b"x".to_vec())));
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[test]
    fn test_reliable_message_acknowledged() {
        let link = Link::new(&host_config());
        let (mut client, mut server) = connected_pair(&link);

        let message = BytesMessage::new(3, b"payload".to_vec()).with_reliable();
        let (sequence, output) = link.run(|cx| client.send(cx, &message));
        assert_eq!(sequence.unwrap(), Some(0));
        assert_eq!(client.in_flight(), 1);

        let at_server = deliver(&link, &mut server, output.datagrams);
        assert_eq!(received(&at_server), vec![b"payload".to_vec()]);
        assert_eq!(at_server.datagrams.len(), 1);

        let at_client = deliver(&link, &mut client, at_server.datagrams);
        assert_eq!(client.in_flight(), 0);
        assert!(at_client.events.iter().any(|event| matches!(
            event,
            PeerEvent::Acknowledged {
                channel: 3,
                sequence: 0
            }
        )));
    }

    #[test]
    fn test_batched_messages_are_combined() {
        let link = Link::new(&host_config());
        let (mut client, mut server) = connected_pair(&link);
        client.config.send_delay = Duration::from_millis(15);

        let ((), queued) = link.run(|cx| {
            for i in 0..3u8 {
                client.send(cx, &BytesMessage::new(0, vec![i; 8])).unwrap();
            }
        });
        assert!(queued.datagrams.is_empty());

        let mut link = link;
        link.now += Duration::from_millis(20);
        let ((), flushed) = link.run(|cx| client.tick(cx));
        assert_eq!(flushed.datagrams.len(), 1);

        let at_server = deliver(&link, &mut server, flushed.datagrams);
        assert_eq!(
            received(&at_server),
            vec![vec![0; 8], vec![1; 8], vec![2; 8]]
        );
    }

    #[test]
    fn test_large_message_fragments() {
        let link = Link::new(&host_config());
        let (mut client, mut server) = connected_pair(&link);

        let mut payload = vec![0u8; 5000];
        StdRng::seed_from_u64(7).fill_bytes(&mut payload);
        let message = BytesMessage::new(0, payload.clone()).with_reliable();
        let ((), output) = link.run(|cx| {
            client.send(cx, &message).unwrap();
        });
        assert!(output.datagrams.len() > 1);
        assert!(output
            .datagrams
            .iter()
            .all(|datagram| datagram.len() <= client.config().mtu));

        let at_server = deliver(&link, &mut server, output.datagrams);
        assert_eq!(received(&at_server), vec![payload]);
    }

    #[test]
    fn test_incomplete_fragments_expire() {
        let link = Link::new(&host_config());
        let config = PeerConfig {
            fragment_timeout: Duration::from_millis(200),
            ..peer_config()
        };
        let (mut client, mut server) = connected_pair_with(&link, config);

        let mut payload = vec![0u8; 3000];
        StdRng::seed_from_u64(3).fill_bytes(&mut payload);
        let ((), output) = link.run(|cx| {
            client.send(cx, &BytesMessage::new(0, payload)).unwrap();
        });
        let mut datagrams = output.datagrams;
        assert!(datagrams.len() >= 3);
        let held = datagrams.remove(1);

        let at_server = deliver(&link, &mut server, datagrams);
        assert!(received(&at_server).is_empty());
        assert_eq!(server.fragments.pending(), 1);

        // Stay short of the first ping
        let pooled = link.shared.allocator.pooled_messages();
        let mut link = link;
        link.now += Duration::from_millis(220);
        let ((), _) = link.run(|cx| server.tick(cx));
        assert_eq!(server.fragments.pending(), 0);
        assert!(link.shared.allocator.pooled_messages() >= pooled + 2);

        // The late part starts a new group instead of completing the old one
        let late = deliver(&link, &mut server, vec![held]);
        assert!(received(&late).is_empty());
        assert_eq!(server.fragments.pending(), 1);
    }

    #[test]
    fn test_crossed_requests_connect_both() {
        let link = Link::new(&host_config());
        let (a, a_out) = link.run(|cx| Peer::connect(cx, addr(2), peer_config(), b"a"));
        let (b, b_out) = link.run(|cx| Peer::connect(cx, addr(1), peer_config(), b"b"));
        let (mut a, mut b) = (a.unwrap(), b.unwrap());
        let b_request = b_out.datagrams.clone();

        let at_a = deliver(&link, &mut a, b_out.datagrams);
        let at_b = deliver(&link, &mut b, a_out.datagrams);
        assert!(matches!(at_a.events[..], [PeerEvent::Connected]));
        assert!(matches!(at_b.events[..], [PeerEvent::Connected]));
        assert!(a.info().encrypted && b.info().encrypted);

        // The accepts cross too and change nothing
        assert!(deliver(&link, &mut a, at_b.datagrams).events.is_empty());
        assert!(deliver(&link, &mut b, at_a.datagrams).events.is_empty());

        let message = BytesMessage::new(1, b"crossed".to_vec()).with_reliable();
        let (sequence, output) = link.run(|cx| a.send(cx, &message));
        sequence.unwrap();
        let at_b = deliver(&link, &mut b, output.datagrams);
        assert_eq!(received(&at_b), vec![b"crossed".to_vec()]);

        // Acks count as traffic, a replayed request now goes unanswered
        deliver(&link, &mut a, at_b.datagrams);
        let replay = deliver(&link, &mut a, b_request);
        assert!(replay.datagrams.is_empty());
        assert_eq!(a.state(), PeerState::Connected);
    }

    #[test]
    fn test_crossed_request_waits_for_signed_accept() {
        let link = Link::new(&host_config());
        let config = PeerConfig {
            remote_public_key: Some(STANDARD.encode([7u8; RSA_MODULUS_SIZE])),
            ..peer_config()
        };
        let (a, _) = link.run(|cx| Peer::connect(cx, addr(2), config, b"a"));
        let (b, b_out) = link.run(|cx| Peer::connect(cx, addr(1), peer_config(), b"b"));
        let (mut a, _b) = (a.unwrap(), b.unwrap());

        let at_a = deliver(&link, &mut a, b_out.datagrams);
        assert!(at_a.events.is_empty());
        assert_eq!(at_a.datagrams.len(), 1);
        let (header, _) = decode_packet(&at_a.datagrams[0]).unwrap();
        assert_eq!(header.packet_type, PacketType::Accept);
        assert_eq!(a.state(), PeerState::Connecting);
    }

    #[test]
    fn test_unique_duplicate_dropped() {
        let link = Link::new(&host_config());
        let (mut client, mut server) = connected_pair(&link);

        let message = BytesMessage::new(0, b"once".to_vec()).with_unique();
        let ((), output) = link.run(|cx| {
            client.send(cx, &message).unwrap();
        });
        let copy = output.datagrams.clone();
        let first = deliver(&link, &mut server, output.datagrams);
        let second = deliver(&link, &mut server, copy);
        assert_eq!(received(&first).len(), 1);
        assert!(received(&second).is_empty());
        assert_eq!(server.statistics().message_receive_duplicated, 1);
    }

    #[test]
    fn test_resend_until_timeout() {
        let mut link = Link::new(&host_config());
        let (mut client, _server) = connected_pair(&link);
        client.config.resend_count = 3;

        let message = BytesMessage::new(0, b"lost".to_vec()).with_reliable();
        let _ = link.run(|cx| client.send(cx, &message));

        let mut resends = 0;
        let mut disconnected = None;
        for _ in 0..10 {
            link.now += client.config.resend_delay_max;
            let ((), output) = link.run(|cx| client.tick(cx));
            resends += output.datagrams.len();
            disconnected = output.events.into_iter().find_map(|event| match event {
                PeerEvent::Disconnected { reason, .. } => Some(reason),
                _ => None,
            });
            if disconnected.is_some() {
                break;
            }
        }
        assert_eq!(disconnected, Some(DisconnectReason::Timeout));
        assert!(resends >= 2);
        assert!(client.is_disconnected());
    }

    #[test]
    fn test_disconnect_reaches_remote() {
        let link = Link::new(&host_config());
        let (mut client, mut server) = connected_pair(&link);
        client.config.disconnect_delay = Duration::ZERO;
        server.config.disconnect_delay = Duration::ZERO;

        let ((), output) = link.run(|cx| client.disconnect(cx, b"bye"));
        assert!(client.is_disconnected());
        assert!(output.events.iter().any(|event| matches!(
            event,
            PeerEvent::Disconnected {
                reason: DisconnectReason::Disconnected,
                ..
            }
        )));

        let at_server = deliver(&link, &mut server, output.datagrams);
        assert!(server.is_disconnected());
        let payload = at_server.events.iter().find_map(|event| match event {
            PeerEvent::Disconnected {
                reason: DisconnectReason::Terminated,
                payload,
            } => Some(payload.clone()),
            _ => None,
        });
        assert_eq!(payload.as_deref(), Some(&b"bye"[..]));
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let link = Link::new(&host_config());
        let (mut client, _) = connected_pair(&link);
        let ((), first) = link.run(|cx| client.dispose(cx));
        let ((), second) = link.run(|cx| client.dispose(cx));
        assert_eq!(first.events.len(), 1);
        assert!(second.is_empty());
    }

    #[test]
    fn test_reject_ends_connect() {
        let link = Link::new(&host_config());
        let (client, _) = link.run(|cx| Peer::connect(cx, addr(2), peer_config(), &[]));
        let mut client = client.unwrap();
        let header = PacketHeader::new(PacketType::Reject);
        let ((), output) = link.run(|cx| client.receive_packet(cx, header, b"full"));
        assert!(matches!(
            &output.events[..],
            [PeerEvent::Disconnected { reason: DisconnectReason::Rejected, payload }] if payload == b"full"
        ));
    }

    #[test]
    fn test_garbage_raises_exception() {
        let link = Link::new(&host_config());
        let (_, mut server) = connected_pair(&link);
        let header = PacketHeader::new(PacketType::Connected).with_ticks(0);
        let ((), output) = link.run(|cx| server.receive_packet(cx, header, &[1, 2, 3]));
        assert!(matches!(output.events[..], [PeerEvent::Exception(_)]));
        assert!(server.is_connected());
    }
}
