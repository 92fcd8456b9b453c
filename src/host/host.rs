//! The host: one UDP socket, its receive threads and the peers it owns.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

use super::events::{event_queue, EventSender, HostEvent, HostEvents, PeerId};
use super::request::ConnectionRequest;
use super::simulator::{Flow, Simulator, Verdict};
use crate::alloc::{Allocator, AllocatorLimits};
use crate::compression::{compress_if_smaller, CompressResult};
use crate::core::{
    CryptoError, HostClock, HostConfig, HostTimestamp, Message, NetError, NetResult, PeerConfig,
};
use crate::crypto::RsaAuthenticator;
use crate::transport::{
    decode_packet, encode_packet, normalize, FrameError, HostSocket, HostStatistics,
    HostStatisticsSnapshot, PacketFlags, PacketHeader, PacketType, Peer, PeerContext, PeerEvent,
    PeerInfo, PeerOutput, PeerShared, TransportError,
};

/// A peer and the handle it is registered under.
#[derive(Debug)]
struct PeerSlot {
    id: PeerId,
    remote: SocketAddr,
    peer: Mutex<Peer>,
}

#[derive(Debug, Default)]
struct PeerTable {
    by_id: HashMap<PeerId, Arc<PeerSlot>>,
    by_addr: HashMap<SocketAddr, PeerId>,
}

/// State shared between the host handle and its threads.
#[derive(Debug)]
struct HostShared {
    config: HostConfig,
    socket: HostSocket,
    local_addr: SocketAddr,
    clock: HostClock,
    peer_shared: PeerShared,
    peers: RwLock<PeerTable>,
    next_id: AtomicU64,
    events: EventSender,
    statistics: HostStatistics,
    simulator: Option<Mutex<Simulator>>,
    shutdown: AtomicBool,
}

/// A UDP endpoint that connects to and accepts peers.
///
/// ```no_run
/// use netcode::prelude::*;
///
/// # fn main() -> Result<(), NetError> {
/// let (host, events) = Host::new(HostConfig::builder().port(7777).build())?;
/// host.start()?;
/// while let Some(event) = events.recv() {
///     if let HostEvent::ConnectionRequested(request) = event {
///         host.accept(&request)?;
///     }
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Host {
    shared: Arc<HostShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Host {
    /// Bind the socket described by `config`.
    ///
    /// No thread runs until [`Host::start`]; until then the host can still be
    /// driven by calling [`Host::tick`] and nothing is read from the socket.
    pub fn new(config: HostConfig) -> NetResult<(Self, HostEvents)> {
        config.validate()?;

        let allocator = Arc::new(Allocator::new(AllocatorLimits::from(&config)));
        let authenticator = match &config.private_key {
            Some(key) => RsaAuthenticator::from_private_key(key)?,
            None => RsaAuthenticator::new(),
        };
        let socket = HostSocket::bind(&config)?;
        let local_addr = socket.local_addr()?;
        let (events, receiver) = event_queue(config.event_queue_capacity);
        let simulator = config
            .simulator
            .clone()
            .map(|simulator| Mutex::new(Simulator::new(simulator)));

        info!(
            %local_addr,
            encryption = config.encryption,
            compression = config.compression,
            authenticated = authenticator.has_private_key(),
            simulated = simulator.is_some(),
            "host bound"
        );

        let shared = HostShared {
            peer_shared: PeerShared::new(&config, allocator, Arc::new(authenticator)),
            config,
            socket,
            local_addr,
            clock: HostClock::new(),
            peers: RwLock::new(PeerTable::default()),
            next_id: AtomicU64::new(1),
            events,
            statistics: HostStatistics::default(),
            simulator,
            shutdown: AtomicBool::new(false),
        };
        let host = Self {
            shared: Arc::new(shared),
            threads: Mutex::new(Vec::new()),
        };
        Ok((host, receiver))
    }

    /// Spawn the receive threads and the ticker. Calling it again is a no-op.
    pub fn start(&self) -> NetResult<()> {
        self.check_running()?;
        let mut threads = self.threads.lock();
        if !threads.is_empty() {
            return Ok(());
        }

        for index in 0..self.shared.config.receive_count {
            let shared = self.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("netcode-recv-{index}"))
                .spawn(move || shared.receive_loop())?;
            threads.push(handle);
        }
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("netcode-tick".into())
            .spawn(move || shared.tick_loop())?;
        threads.push(handle);

        debug!(
            receivers = self.shared.config.receive_count,
            "host threads started"
        );
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Peers
    // ---------------------------------------------------------------------

    /// Connect to `address` with the default peer configuration.
    pub fn connect(&self, address: SocketAddr, payload: &[u8]) -> NetResult<PeerId> {
        self.connect_with(address, PeerConfig::default(), payload)
    }

    /// Connect to `address`. The handshake runs in the background;
    /// [`HostEvent::PeerConnected`] or [`HostEvent::PeerDisconnected`] reports
    /// its outcome.
    pub fn connect_with(
        &self,
        address: SocketAddr,
        config: PeerConfig,
        payload: &[u8],
    ) -> NetResult<PeerId> {
        self.check_running()?;
        config.validate()?;
        let remote = normalize(address);
        if self.find_peer(remote).is_some() {
            return Err(NetError::PeerExists(remote));
        }

        let shared = &*self.shared;
        let now = Instant::now();
        let mut output = PeerOutput::default();
        let peer = {
            let mut cx = shared.context(now, &mut output);
            Peer::connect(&mut cx, remote, config, payload)?
        };
        match shared.insert(remote, peer) {
            Ok(slot) => {
                shared.dispatch(&slot, now, output);
                Ok(slot.id)
            }
            Err(err) => {
                shared.discard(output.datagrams.drain(..));
                Err(err)
            }
        }
    }

    /// Accept a connection request with the default peer configuration.
    pub fn accept(&self, request: &ConnectionRequest) -> NetResult<PeerId> {
        self.accept_with(request, PeerConfig::default())
    }

    /// Accept a connection request. The peer is connected when this returns.
    ///
    /// Accepting a request whose address already has a peer returns that
    /// peer.
    pub fn accept_with(&self, request: &ConnectionRequest, config: PeerConfig) -> NetResult<PeerId> {
        self.check_running()?;
        config.validate()?;
        if config.remote_public_key.is_some() {
            return Err(NetError::Config(
                "remote_public_key only applies to outgoing connections".into(),
            ));
        }
        if request.is_authenticated() && !self.shared.peer_shared.authenticator.has_private_key() {
            return Err(CryptoError::MissingPrivateKey.into());
        }
        let remote = request.remote();
        if let Some(existing) = self.find_peer(remote) {
            return Ok(existing);
        }

        let shared = &*self.shared;
        let now = Instant::now();
        let mut output = PeerOutput::default();
        let peer = {
            let mut cx = shared.context(now, &mut output);
            Peer::accept(&mut cx, remote, config, request.key(), request.challenge())?
        };
        let slot = match shared.insert(remote, peer) {
            Ok(slot) => slot,
            Err(NetError::PeerExists(_)) => {
                shared.discard(output.datagrams.drain(..));
                return self.find_peer(remote).ok_or(NetError::PeerExists(remote));
            }
            Err(err) => return Err(err),
        };
        shared.dispatch(&slot, now, output);
        Ok(slot.id)
    }

    /// Refuse a connection request, sending `payload` with the refusal.
    pub fn reject(&self, request: &ConnectionRequest, payload: &[u8]) -> NetResult<()> {
        self.check_running()?;
        let shared = &*self.shared;
        let mut packet = shared.peer_shared.allocator.create_packet(0);
        encode_packet(
            &PacketHeader::new(PacketType::Reject),
            payload,
            shared.config.crc32,
            &mut packet,
        );
        debug!(remote = %request.remote(), "rejecting connection");
        let result = shared.send_datagram(Instant::now(), request.remote(), &packet);
        shared.peer_shared.allocator.return_packet(packet);
        Ok(result?)
    }

    /// Send `message` to a connected peer. Returns the sequence the message
    /// was given, if any; reliable messages report it again in
    /// [`HostEvent::MessageAcknowledged`].
    pub fn send<M: Message + ?Sized>(&self, peer: PeerId, message: &M) -> NetResult<Option<u16>> {
        self.check_running()?;
        let slot = self.slot(peer)?;
        let result = self
            .shared
            .with_peer(&slot, Instant::now(), |peer, cx| peer.send(cx, message));
        Ok(result?)
    }

    /// Send `message` to every connected peer. Returns how many accepted it.
    pub fn send_all<M: Message + ?Sized>(&self, message: &M) -> NetResult<usize> {
        self.check_running()?;
        let now = Instant::now();
        let mut sent = 0;
        for slot in self.shared.slots() {
            let result = self.shared.with_peer(&slot, now, |peer, cx| {
                if peer.is_connected() {
                    peer.send(cx, message).map(|_| true)
                } else {
                    Ok(false)
                }
            });
            match result {
                Ok(true) => sent += 1,
                Ok(false) => {}
                Err(err) => trace!(peer = %slot.id, %err, "broadcast send skipped peer"),
            }
        }
        Ok(sent)
    }

    /// Close a peer's connection, telling the remote.
    pub fn disconnect(&self, peer: PeerId, payload: &[u8]) -> NetResult<()> {
        self.check_running()?;
        let slot = self.slot(peer)?;
        self.shared
            .with_peer(&slot, Instant::now(), |peer, cx| peer.disconnect(cx, payload));
        Ok(())
    }

    /// Drop a peer immediately without telling the remote.
    pub fn dispose_peer(&self, peer: PeerId) -> NetResult<()> {
        let slot = self.slot(peer)?;
        self.shared
            .with_peer(&slot, Instant::now(), |peer, cx| peer.dispose(cx));
        Ok(())
    }

    /// Peer registered for `address`.
    pub fn find_peer(&self, address: SocketAddr) -> Option<PeerId> {
        self.shared
            .peers
            .read()
            .by_addr
            .get(&normalize(address))
            .copied()
    }

    /// Snapshot of a peer.
    pub fn peer_info(&self, peer: PeerId) -> Option<PeerInfo> {
        let slot = self.shared.peers.read().by_id.get(&peer).cloned()?;
        let info = slot.peer.lock().info();
        Some(info)
    }

    /// Every live peer.
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.shared.peers.read().by_id.keys().copied().collect();
        peers.sort_unstable();
        peers
    }

    // ---------------------------------------------------------------------
    // Connectionless
    // ---------------------------------------------------------------------

    /// Send a single datagram outside any connection.
    pub fn send_unconnected(&self, address: SocketAddr, payload: &[u8]) -> NetResult<()> {
        self.check_running()?;
        self.shared
            .send_connectionless(PacketType::Unconnected, normalize(address), payload)
    }

    /// Broadcast a datagram to `port` on the local network.
    pub fn send_broadcast(&self, port: u16, payload: &[u8]) -> NetResult<()> {
        self.check_running()?;
        if !self.shared.config.broadcast {
            return Err(NetError::Config("broadcast is disabled".into()));
        }
        let ip = if self.shared.local_addr.is_ipv6() {
            // All-nodes link-local multicast stands in for broadcast on IPv6
            IpAddr::V6(Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1))
        } else {
            IpAddr::V4(Ipv4Addr::BROADCAST)
        };
        self.shared
            .send_connectionless(PacketType::Broadcast, SocketAddr::new(ip, port), payload)
    }

    // ---------------------------------------------------------------------
    // Housekeeping
    // ---------------------------------------------------------------------

    /// Drive every timer once: simulator queue, handshakes, resends, pings,
    /// sweeps and batching. The ticker thread calls this every
    /// `tick_interval`; calling it manually is harmless.
    pub fn tick(&self) -> NetResult<()> {
        self.check_running()?;
        self.shared.tick(Instant::now());
        Ok(())
    }

    /// Disconnect every peer, stop the threads and release pooled buffers.
    ///
    /// Safe to call more than once and from any thread. Emits
    /// [`HostEvent::Shutdown`] the first time.
    pub fn shutdown(&self) {
        self.shared.close(None);

        let current = thread::current().id();
        let handles: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            let name = handle.thread().name().map(str::to_owned);
            if handle.join().is_err() {
                warn!(thread = ?name, "host thread panicked");
            }
        }
        self.shared.peer_shared.allocator.clear();
    }

    /// Whether the host has shut down.
    pub fn is_shutdown(&self) -> bool {
        self.shared.is_shutdown()
    }

    /// Current host time.
    pub fn now(&self) -> HostTimestamp {
        self.shared.clock.now()
    }

    /// Socket counters.
    pub fn statistics(&self) -> HostStatisticsSnapshot {
        self.shared.statistics.snapshot()
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Configuration the host runs with.
    pub fn config(&self) -> &HostConfig {
        &self.shared.config
    }

    fn check_running(&self) -> NetResult<()> {
        if self.shared.is_shutdown() {
            Err(NetError::Shutdown)
        } else {
            Ok(())
        }
    }

    fn slot(&self, peer: PeerId) -> NetResult<Arc<PeerSlot>> {
        self.shared
            .peers
            .read()
            .by_id
            .get(&peer)
            .cloned()
            .ok_or(NetError::UnknownPeer(peer))
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl HostShared {
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn context<'a>(&'a self, now: Instant, output: &'a mut PeerOutput) -> PeerContext<'a> {
        PeerContext {
            now,
            clock: &self.clock,
            shared: &self.peer_shared,
            output,
        }
    }

    // ---------------------------------------------------------------------
    // Peer table
    // ---------------------------------------------------------------------

    fn insert(&self, remote: SocketAddr, peer: Peer) -> NetResult<Arc<PeerSlot>> {
        let mut table = self.peers.write();
        if table.by_addr.contains_key(&remote) {
            return Err(NetError::PeerExists(remote));
        }
        let id = PeerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let slot = Arc::new(PeerSlot {
            id,
            remote,
            peer: Mutex::new(peer),
        });
        table.by_addr.insert(remote, id);
        table.by_id.insert(id, slot.clone());
        trace!(peer = %id, %remote, "peer registered");
        Ok(slot)
    }

    fn remove(&self, slot: &PeerSlot) {
        let mut table = self.peers.write();
        let registered = table
            .by_id
            .get(&slot.id)
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), slot));
        if !registered {
            return;
        }
        table.by_id.remove(&slot.id);
        if table.by_addr.get(&slot.remote) == Some(&slot.id) {
            table.by_addr.remove(&slot.remote);
        }
        trace!(peer = %slot.id, remote = %slot.remote, "peer removed");
    }

    fn slot_by_addr(&self, remote: SocketAddr) -> Option<Arc<PeerSlot>> {
        let table = self.peers.read();
        let id = table.by_addr.get(&remote)?;
        table.by_id.get(id).cloned()
    }

    fn slots(&self) -> Vec<Arc<PeerSlot>> {
        self.peers.read().by_id.values().cloned().collect()
    }

    /// Run `f` under the peer's lock, then send what it produced and
    /// publish its events with the lock released.
    fn with_peer<R>(
        &self,
        slot: &PeerSlot,
        now: Instant,
        f: impl FnOnce(&mut Peer, &mut PeerContext<'_>) -> R,
    ) -> R {
        let mut output = PeerOutput::default();
        let (result, disconnected) = {
            let mut peer = slot.peer.lock();
            let mut cx = self.context(now, &mut output);
            let result = f(&mut peer, &mut cx);
            (result, peer.is_disconnected())
        };
        if disconnected {
            self.remove(slot);
        }
        self.dispatch(slot, now, output);
        result
    }

    fn dispatch(&self, slot: &PeerSlot, now: Instant, output: PeerOutput) {
        let PeerOutput { datagrams, events } = output;
        for datagram in datagrams {
            if let Err(err) = self.send_datagram(now, slot.remote, &datagram) {
                self.events.emit(HostEvent::PeerException {
                    peer: slot.id,
                    error: TransportError::Io(err),
                });
            }
            self.peer_shared.allocator.return_packet(datagram);
        }
        for event in events {
            self.events.emit(peer_event(slot, event));
        }
    }

    fn discard(&self, datagrams: impl Iterator<Item = Vec<u8>>) {
        for datagram in datagrams {
            self.peer_shared.allocator.return_packet(datagram);
        }
    }

    // ---------------------------------------------------------------------
    // Socket
    // ---------------------------------------------------------------------

    fn send_datagram(&self, now: Instant, remote: SocketAddr, data: &[u8]) -> io::Result<()> {
        if let Some(simulator) = &self.simulator {
            match simulator.lock().outgoing(now, remote, data) {
                Verdict::Pass => {}
                Verdict::Drop | Verdict::Delayed => return Ok(()),
            }
        }
        self.send_raw(remote, data)
    }

    fn send_raw(&self, remote: SocketAddr, data: &[u8]) -> io::Result<()> {
        let sent = self.socket.send_to(data, remote)?;
        self.statistics.record_send(self.clock.now(), sent);
        Ok(())
    }

    fn send_connectionless(
        &self,
        packet_type: PacketType,
        remote: SocketAddr,
        payload: &[u8],
    ) -> NetResult<()> {
        let allocator = &self.peer_shared.allocator;
        let mut compressed = allocator.create_message(0);
        let mut flags = PacketFlags::NONE;
        let mut body = payload;
        if self.config.compression {
            if let CompressResult::Compressed(len) =
                compress_if_smaller(&*self.peer_shared.compressor, payload, &mut compressed)
            {
                flags = flags.with(PacketFlags::COMPRESSED);
                body = &compressed[..len];
            }
        }

        let mut packet = allocator.create_packet(0);
        encode_packet(
            &PacketHeader::new(packet_type).with_flags(flags),
            body,
            self.config.crc32,
            &mut packet,
        );
        allocator.return_message(compressed);

        let limit = self.config.receive_mtu;
        let result = if packet.len() > limit {
            Err(NetError::Transport(TransportError::MessageTooLarge {
                size: packet.len(),
                limit,
            }))
        } else {
            self.send_datagram(Instant::now(), remote, &packet)
                .map_err(NetError::from)
        };
        allocator.return_packet(packet);
        result
    }

    fn receive_loop(&self) {
        let mut buf = vec![0u8; self.config.receive_mtu];
        while !self.is_shutdown() {
            match self.socket.recv_from(&mut buf) {
                Ok(Some((len, remote))) => self.on_datagram(Instant::now(), remote, &buf[..len]),
                Ok(None) => {}
                Err(err) if is_transient(&err) => {
                    trace!(%err, "transient socket error");
                }
                Err(err) => {
                    error!(%err, "socket failed, shutting down");
                    self.close(Some(err));
                    break;
                }
            }
        }
        trace!("receive loop stopped");
    }

    fn tick_loop(&self) {
        let interval = self.config.tick_interval;
        while !self.is_shutdown() {
            self.tick(Instant::now());
            thread::sleep(interval);
        }
        trace!("tick loop stopped");
    }

    // ---------------------------------------------------------------------
    // Receiving
    // ---------------------------------------------------------------------

    fn on_datagram(&self, now: Instant, remote: SocketAddr, data: &[u8]) {
        self.statistics
            .record_receive(self.clock.timestamp(now), data.len());
        if let Some(simulator) = &self.simulator {
            match simulator.lock().incoming(now, remote, data) {
                Verdict::Pass => {}
                Verdict::Drop | Verdict::Delayed => return,
            }
        }
        self.process_datagram(now, remote, data);
    }

    fn process_datagram(&self, now: Instant, remote: SocketAddr, data: &[u8]) {
        let (header, body) = match decode_packet(data) {
            Ok(decoded) => decoded,
            Err(error) => {
                debug!(%remote, %error, len = data.len(), "dropped datagram");
                return self.events.emit(HostEvent::Exception { remote, error });
            }
        };

        match header.packet_type {
            PacketType::Request
            | PacketType::Accept
            | PacketType::Reject
            | PacketType::Connected => {
                if let Some(slot) = self.slot_by_addr(remote) {
                    self.with_peer(&slot, now, |peer, cx| peer.receive_packet(cx, header, body));
                } else if header.packet_type == PacketType::Request {
                    self.receive_request(remote, header, body);
                } else {
                    trace!(%remote, packet = %header.packet_type, "packet for unknown peer");
                    self.events.emit(HostEvent::Exception {
                        remote,
                        error: TransportError::UnexpectedPacket(header.packet_type.name()),
                    });
                }
            }
            PacketType::Unconnected | PacketType::Broadcast => {
                self.receive_connectionless(remote, header, body)
            }
        }
    }

    fn receive_request(&self, remote: SocketAddr, header: PacketHeader, body: &[u8]) {
        let allocator = &self.peer_shared.allocator;
        let mut decompressed = allocator.create_message(0);
        let result = if header.flags.contains(PacketFlags::COMPRESSED) {
            self.decompress(body, &mut decompressed)
                .and_then(|()| {
                    ConnectionRequest::parse(remote, &decompressed).map_err(TransportError::from)
                })
        } else {
            ConnectionRequest::parse(remote, body).map_err(TransportError::from)
        };
        allocator.return_message(decompressed);

        match result {
            Ok(request) => {
                debug!(
                    %remote,
                    encrypted = request.is_encrypted(),
                    authenticated = request.is_authenticated(),
                    "connection requested"
                );
                self.events.emit(HostEvent::ConnectionRequested(request));
            }
            Err(error) => {
                debug!(%remote, %error, "malformed connection request");
                self.events.emit(HostEvent::Exception { remote, error });
            }
        }
    }

    fn receive_connectionless(&self, remote: SocketAddr, header: PacketHeader, body: &[u8]) {
        if header.ticks.is_some()
            || header.fragment.is_some()
            || header.flags.contains(PacketFlags::COMBINED)
        {
            return self.events.emit(HostEvent::Exception {
                remote,
                error: FrameError::MalformedPayload("connectionless flags").into(),
            });
        }

        let payload = if header.flags.contains(PacketFlags::COMPRESSED) {
            let mut payload = Vec::new();
            if let Err(error) = self.decompress(body, &mut payload) {
                debug!(%remote, %error, "undecodable connectionless packet");
                return self.events.emit(HostEvent::Exception { remote, error });
            }
            payload
        } else {
            body.to_vec()
        };

        let event = if header.packet_type == PacketType::Broadcast {
            HostEvent::BroadcastReceived { remote, payload }
        } else {
            HostEvent::UnconnectedReceived { remote, payload }
        };
        self.events.emit(event);
    }

    fn decompress(&self, body: &[u8], out: &mut Vec<u8>) -> Result<(), TransportError> {
        let len = self.peer_shared.compressor.decompress(body, out)?;
        out.truncate(len);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Timers and shutdown
    // ---------------------------------------------------------------------

    fn tick(&self, now: Instant) {
        if let Some(simulator) = &self.simulator {
            let due = simulator.lock().due(now);
            for delayed in due {
                match delayed.flow {
                    Flow::Incoming => self.process_datagram(now, delayed.remote, &delayed.data),
                    Flow::Outgoing => {
                        if let Err(err) = self.send_raw(delayed.remote, &delayed.data) {
                            self.events.emit(HostEvent::Exception {
                                remote: delayed.remote,
                                error: TransportError::Io(err),
                            });
                        }
                    }
                }
            }
        }

        for slot in self.slots() {
            self.with_peer(&slot, now, |peer, cx| peer.tick(cx));
        }
    }

    /// Stop the host. Returns `false` if it was already stopped.
    fn close(&self, error: Option<io::Error>) -> bool {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return false;
        }

        let now = Instant::now();
        let slots = self.slots();
        for slot in &slots {
            self.with_peer(slot, now, |peer, cx| {
                peer.disconnect(cx, &[]);
                peer.dispose(cx);
            });
        }
        {
            let mut table = self.peers.write();
            table.by_id.clear();
            table.by_addr.clear();
        }

        info!(
            local_addr = %self.local_addr,
            peers = slots.len(),
            failed = error.is_some(),
            "host shut down"
        );
        self.events.emit(HostEvent::Shutdown { error });
        true
    }
}

fn peer_event(slot: &PeerSlot, event: PeerEvent) -> HostEvent {
    let peer = slot.id;
    match event {
        PeerEvent::Connected => HostEvent::PeerConnected {
            peer,
            remote: slot.remote,
        },
        PeerEvent::Received(message) => HostEvent::PeerReceived { peer, message },
        PeerEvent::Disconnected { reason, payload } => HostEvent::PeerDisconnected {
            peer,
            remote: slot.remote,
            reason,
            payload,
        },
        PeerEvent::Exception(error) => HostEvent::PeerException { peer, error },
        PeerEvent::RttUpdated(rtt) => HostEvent::PeerRttUpdated { peer, rtt },
        PeerEvent::Acknowledged { channel, sequence } => HostEvent::MessageAcknowledged {
            peer,
            channel,
            sequence,
        },
    }
}

/// Errors a UDP socket reports for something that happened to an earlier
/// datagram, such as an ICMP port unreachable.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::{BytesMessage, SimulatorConfig, CHALLENGE_SIZE};
    use crate::transport::DisconnectReason;

    const WAIT: Duration = Duration::from_secs(5);

    fn config() -> HostConfig {
        HostConfig {
            bind_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            port: 0,
            receive_count: 1,
            ..HostConfig::default()
        }
    }

    fn started(config: HostConfig) -> (Host, HostEvents) {
        let (host, events) = Host::new(config).unwrap();
        host.start().unwrap();
        (host, events)
    }

    fn wait_for<T>(events: &HostEvents, mut f: impl FnMut(HostEvent) -> Option<T>) -> T {
        let deadline = Instant::now() + WAIT;
        while let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
            if let Some(value) = events.recv_timeout(remaining).and_then(&mut f) {
                return value;
            }
        }
        panic!("timed out waiting for event");
    }

    fn pair() -> (Host, HostEvents, Host, HostEvents, PeerId, PeerId) {
        let (client, client_events) = started(config());
        let (server, server_events) = started(config());

        let peer = client.connect(server.local_addr(), b"hello?").unwrap();
        let request = wait_for(&server_events, |event| match event {
            HostEvent::ConnectionRequested(request) => Some(request),
            _ => None,
        });
        assert_eq!(request.payload(), b"hello?");
        assert_eq!(request.remote(), client.local_addr());
        let accepted = server.accept(&request).unwrap();

        wait_for(&client_events, |event| match event {
            HostEvent::PeerConnected { peer: id, .. } if id == peer => Some(()),
            _ => None,
        });
        (client, client_events, server, server_events, peer, accepted)
    }

    #[test]
    fn test_connect_send_and_receive() {
        let (client, _client_events, server, server_events, peer, accepted) = pair();
        assert!(client.peer_info(peer).unwrap().encrypted);

        let message = BytesMessage::new(1, b"hello".to_vec())
            .with_reliable()
            .with_ordered();
        client.send(peer, &message).unwrap();

        let received = wait_for(&server_events, |event| match event {
            HostEvent::PeerReceived { peer, message } if peer == accepted => Some(message),
            _ => None,
        });
        assert_eq!(received.channel, 1);
        assert_eq!(received.payload, b"hello");
        assert!(received.reliable && received.ordered);
        assert_eq!(server.find_peer(client.local_addr()), Some(accepted));
    }

    #[test]
    fn test_disconnect_reaches_server() {
        let (client, client_events, server, server_events, peer, accepted) = pair();
        client.disconnect(peer, b"bye").unwrap();

        let (reason, payload) = wait_for(&server_events, |event| match event {
            HostEvent::PeerDisconnected {
                peer,
                reason,
                payload,
                ..
            } if peer == accepted => Some((reason, payload)),
            _ => None,
        });
        assert_eq!(reason, DisconnectReason::Terminated);
        assert_eq!(payload, b"bye");

        let reason = wait_for(&client_events, |event| match event {
            HostEvent::PeerDisconnected { peer: id, reason, .. } if id == peer => Some(reason),
            _ => None,
        });
        assert_eq!(reason, DisconnectReason::Disconnected);
        assert!(client.peer_info(peer).is_none());
        assert!(server.find_peer(client.local_addr()).is_none());
    }

    #[test]
    fn test_reject_reaches_client() {
        let (client, client_events) = started(config());
        let (server, server_events) = started(config());

        let peer = client.connect(server.local_addr(), &[]).unwrap();
        let request = wait_for(&server_events, |event| match event {
            HostEvent::ConnectionRequested(request) => Some(request),
            _ => None,
        });
        server.reject(&request, b"full").unwrap();

        let (reason, payload) = wait_for(&client_events, |event| match event {
            HostEvent::PeerDisconnected {
                peer: id,
                reason,
                payload,
                ..
            } if id == peer => Some((reason, payload)),
            _ => None,
        });
        assert_eq!(reason, DisconnectReason::Rejected);
        assert_eq!(payload, b"full");
    }

    #[test]
    fn test_unconnected_round_trip() {
        let (sender, _sender_events) = started(config());
        let (receiver, receiver_events) = started(config());

        let payload = vec![7u8; 600];
        sender
            .send_unconnected(receiver.local_addr(), &payload)
            .unwrap();
        let (remote, received) = wait_for(&receiver_events, |event| match event {
            HostEvent::UnconnectedReceived { remote, payload } => Some((remote, payload)),
            _ => None,
        });
        assert_eq!(remote, sender.local_addr());
        assert_eq!(received, payload);
    }

    #[test]
    fn test_garbage_raises_exception() {
        let (host, events) = started(config());
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.send_to(&[0x05, 1, 2, 3], host.local_addr()).unwrap();

        let remote = wait_for(&events, |event| match event {
            HostEvent::Exception { remote, .. } => Some(remote),
            _ => None,
        });
        assert_eq!(remote, socket.local_addr().unwrap());
        assert!(host.statistics().socket_receive_count >= 1);
    }

    #[test]
    fn test_duplicate_connect_rejected() {
        let (host, _events) = Host::new(config()).unwrap();
        let target: SocketAddr = "127.0.0.1:9".parse().unwrap();
        host.connect(target, &[]).unwrap();
        assert!(matches!(
            host.connect(target, &[]),
            Err(NetError::PeerExists(addr)) if addr == target
        ));
        assert_eq!(host.peers().len(), 1);
    }

    #[test]
    fn test_unknown_peer() {
        let (host, _events) = Host::new(config()).unwrap();
        let message = BytesMessage::new(0, b"x".to_vec());
        assert!(matches!(
            host.send(PeerId(99), &message),
            Err(NetError::UnknownPeer(PeerId(99)))
        ));
        assert!(host.peer_info(PeerId(99)).is_none());
    }

    #[test]
    fn test_accept_challenge_without_private_key() {
        let (host, _events) = Host::new(config()).unwrap();
        let mut body = Vec::new();
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&(CHALLENGE_SIZE as u16).to_le_bytes());
        body.extend_from_slice(&[3u8; CHALLENGE_SIZE]);
        let request = ConnectionRequest::parse("127.0.0.1:9".parse().unwrap(), &body).unwrap();

        assert!(matches!(
            host.accept(&request),
            Err(NetError::Crypto(CryptoError::MissingPrivateKey))
        ));
    }

    #[test]
    fn test_broadcast_disabled() {
        let (host, _events) = Host::new(HostConfig {
            broadcast: false,
            ..config()
        })
        .unwrap();
        assert!(matches!(
            host.send_broadcast(9000, b"x"),
            Err(NetError::Config(_))
        ));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (host, events) = started(config());
        host.connect("127.0.0.1:9".parse().unwrap(), &[]).unwrap();
        host.shutdown();
        host.shutdown();

        let shutdowns = events
            .drain()
            .into_iter()
            .filter(|event| matches!(event, HostEvent::Shutdown { error: None }))
            .count();
        assert_eq!(shutdowns, 1);
        assert!(host.peers().is_empty());
        assert!(matches!(host.tick(), Err(NetError::Shutdown)));
        assert!(matches!(
            host.connect("127.0.0.1:9".parse().unwrap(), &[]),
            Err(NetError::Shutdown)
        ));
    }

    #[test]
    fn test_simulated_latency_delays_delivery() {
        let (sender, _sender_events) = started(config());
        let (receiver, receiver_events) = started(HostConfig {
            simulator: Some(SimulatorConfig {
                incoming_latency: Duration::from_millis(80),
                seed: Some(5),
                ..SimulatorConfig::default()
            }),
            ..config()
        });

        let started_at = Instant::now();
        sender
            .send_unconnected(receiver.local_addr(), b"late")
            .unwrap();
        let payload = wait_for(&receiver_events, |event| match event {
            HostEvent::UnconnectedReceived { payload, .. } => Some(payload),
            _ => None,
        });
        assert_eq!(payload, b"late");
        assert!(started_at.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn test_invalid_config() {
        let result = Host::new(HostConfig {
            receive_count: 0,
            ..config()
        });
        assert!(matches!(result, Err(NetError::Config(_))));
    }
}
