//! Peer-logic state machine.
//!
//! [`StateMachine`] holds all per-peer protocol state and drives the
//! wire protocol: the inbound dispatcher enforces the handshake ordering
//! contract and routes each message, and the per-peer send tick emits
//! pings, address broadcasts, block and transaction announcements, block
//! requests and fee filters in a fixed order.
//!
//! The machine is deterministic: the embedding node feeds it connection
//! events, decoded messages and wake-ups, and drains [`Io`]
//! instructions. The chain engine, mempool and address store are type
//! parameters behind narrow interfaces.
use std::borrow::Cow;

use crossbeam_channel as chan;
use log::*;
use nonempty::NonEmpty;

pub mod addrmgr;
pub mod blockmgr;
pub mod cmpct;
pub mod event;
pub mod invmgr;
pub mod nodestate;
pub mod output;
pub mod pingmgr;
pub mod syncmgr;

#[cfg(test)]
mod tests;

use bitcoin::consensus::encode::deserialize;
use bitcoin::hashes::Hash as _;
use bitcoin::network::address::Address;
use bitcoin::network::constants::ServiceFlags;
use bitcoin::network::message::{CommandString, NetworkMessage, RawNetworkMessage};
use bitcoin::network::message_blockdata::{GetBlocksMessage, GetHeadersMessage, Inventory};
use bitcoin::network::message_compact_blocks::{GetBlockTxn, SendCmpct};
use bitcoin::network::message_network::{Reject, RejectReason, VersionMessage};
use bitcoin::util::bip152::{BlockTransactions, BlockTransactionsRequest, HeaderAndShortIds};
use bitcoin::{Block, BlockHash, Transaction, Txid};

use galena_common::block::time::{AdjustedTime, Clock, LocalDuration, LocalTime};
use galena_common::block::Height;
use galena_common::chain::{BlockId, BlockVerdict, Chain, ValidationLevel};
use galena_common::mempool::Mempool;
use galena_common::network::Network;
use galena_common::p2p::{AddressSource, ConnectInfo, Interrupt, PeerId};

use addrmgr::AddressManager;
use blockmgr::BlockManager;
use cmpct::{CmpctError, PartialBlock};
use invmgr::InventoryManager;
use nodestate::{BlockReject, InFlight, NodeStates};
use output::{Disconnect as _, Wakeup as _};
use pingmgr::PingManager;
use syncmgr::SyncManager;

pub use event::Event;
pub use nodestate::NodeStateStats;
pub use output::{Io, Outbox};

/// Peer-to-peer protocol version spoken by this node.
pub const PROTOCOL_VERSION: u32 = 70015;
/// Version used for messages sent before the version handshake settles.
pub const INIT_PROTO_VERSION: u32 = 209;
/// Baseline peer protocol version; the chain engine may require more.
pub const MIN_PEER_PROTO_VERSION: u32 = 31800;
/// User agent advertised in `version` messages.
pub const USER_AGENT: &str = "/galena:0.1.0/";

/// `pong` support (BIP 31) appeared after this version.
pub const BIP0031_VERSION: u32 = 60000;
/// `addr` entries carry timestamps from this version.
pub const CADDR_TIME_VERSION: u32 = 31402;
/// Peers at or above this version know not to send us bloom traffic
/// unless we advertise the service.
pub const NO_BLOOM_VERSION: u32 = 70011;
/// `sendheaders` support.
pub const SENDHEADERS_VERSION: u32 = 70012;
/// `feefilter` support.
pub const FEEFILTER_VERSION: u32 = 70013;
/// Compact block support (BIP 152).
pub const SHORT_IDS_BLOCKS_VERSION: u32 = 70014;
/// Compact blocks may be relayed before full validation from this
/// version on.
pub const INVALID_CB_NO_BAN_VERSION: u32 = 70015;

/// Maximum number of headers in a `headers` message.
pub const MAX_HEADERS_RESULTS: usize = 2000;
/// Maximum number of entries in an `inv` or `getdata` message.
pub const MAX_INV_SZ: usize = 50_000;
/// Maximum blocks in flight per peer.
pub const MAX_BLOCKS_IN_TRANSIT_PER_PEER: usize = 16;
/// Window beyond the last shared block within which blocks are fetched.
pub const BLOCK_DOWNLOAD_WINDOW: u64 = 1024;
/// Maximum consecutive blocks announced via headers.
pub const MAX_BLOCKS_TO_ANNOUNCE: usize = 8;
/// Unconnecting header announcements per misbehavior increment.
pub const MAX_UNCONNECTING_HEADERS: u32 = 10;
/// Maximum addresses per `addr` message.
pub const MAX_ADDR_TO_SEND: usize = 1000;
/// Maximum entries per outgoing `getdata` message.
pub const MAX_GETDATA_BATCH: usize = 1000;
/// Depth below the tip up to which blocks are served in compact form.
pub const MAX_CMPCTBLOCK_DEPTH: u64 = 5;
/// Depth below the tip up to which `getblocktxn` is answered.
pub const MAX_BLOCKTXN_DEPTH: u64 = 10;
/// Maximum length of the reason string in a `reject` message.
pub const MAX_REJECT_MESSAGE_LENGTH: usize = 111;
/// Outbound peers shielded from chain-sync eviction.
pub const MAX_OUTBOUND_PEERS_TO_PROTECT_FROM_DISCONNECT: usize = 4;
/// Default misbehavior score at which a peer is banned.
pub const DEFAULT_BANSCORE_THRESHOLD: u32 = 100;
/// Maximum transaction inventories per trickle.
pub const INVENTORY_BROADCAST_MAX: usize = 35;

/// Interval between latency probes.
pub const PING_INTERVAL: LocalDuration = LocalDuration::from_mins(2);
/// How long the download window may stay blocked on one peer.
pub const BLOCK_STALLING_TIMEOUT: LocalDuration = LocalDuration::from_secs(2);
/// Block download timeout base, in microseconds per target spacing.
pub const BLOCK_DOWNLOAD_TIMEOUT_BASE: u64 = 1_000_000;
/// Additional block download timeout per downloading peer.
pub const BLOCK_DOWNLOAD_TIMEOUT_PER_PEER: u64 = 500_000;
/// Base deadline for initial headers sync.
pub const HEADERS_DOWNLOAD_TIMEOUT_BASE: LocalDuration = LocalDuration::from_mins(15);
/// Additional headers-sync deadline per expected header.
pub const HEADERS_DOWNLOAD_TIMEOUT_PER_HEADER: LocalDuration = LocalDuration::from_millis(1);
/// How long an outbound peer may lag our tip before being probed.
pub const CHAIN_SYNC_TIMEOUT: LocalDuration = LocalDuration::from_mins(20);
/// Grace period for the chain-sync probe to be answered.
pub const HEADERS_RESPONSE_TIME: LocalDuration = LocalDuration::from_mins(2);
/// Interval between stale-tip checks.
pub const STALE_CHECK_INTERVAL: LocalDuration = LocalDuration::from_mins(10);
/// Interval between extra-outbound-peer eviction checks.
pub const EXTRA_PEER_CHECK_INTERVAL: LocalDuration = LocalDuration::from_secs(45);
/// Minimum connection age before a peer may be evicted as extra.
pub const MINIMUM_CONNECT_TIME: LocalDuration = LocalDuration::from_secs(30);
/// Average interval between `addr` flushes.
pub const AVG_ADDRESS_BROADCAST_INTERVAL: LocalDuration = LocalDuration::from_secs(30);
/// Average interval between self-advertisements.
pub const AVG_LOCAL_ADDRESS_BROADCAST_INTERVAL: LocalDuration = LocalDuration::from_hours(24);
/// Average interval between transaction inventory trickles.
pub const INVENTORY_BROADCAST_INTERVAL: LocalDuration = LocalDuration::from_secs(5);
/// Average interval between `feefilter` updates.
pub const AVG_FEEFILTER_BROADCAST_INTERVAL: LocalDuration = LocalDuration::from_mins(10);
/// How soon a drifted fee filter is re-announced.
pub const MAX_FEEFILTER_CHANGE_DELAY: LocalDuration = LocalDuration::from_mins(5);

/// Reject code: message could not be parsed.
pub const REJECT_MALFORMED: u8 = 0x01;
/// Reject code: data failed validation.
pub const REJECT_INVALID: u8 = 0x10;
/// Reject code: obsolete protocol or data.
pub const REJECT_OBSOLETE: u8 = 0x11;
/// Reject code: duplicate of something we have.
pub const REJECT_DUPLICATE: u8 = 0x12;
/// Reject code: nonstandard.
pub const REJECT_NONSTANDARD: u8 = 0x40;

/// Block locators: starting hashes, highest first, and a stop hash.
pub type Locators = (Vec<BlockHash>, BlockHash);

/// Why a peer is being disconnected.
#[derive(Debug, Clone)]
pub enum DisconnectReason {
    /// Message carried the wrong network magic.
    PeerMagic(u32),
    /// Peer speaks an obsolete protocol version.
    ObsoleteVersion(u32),
    /// Peer does not offer the services we require.
    PeerServices(ServiceFlags),
    /// We connected to ourselves.
    SelfConnection,
    /// Peer announced a chain containing a known-invalid block.
    InvalidChain,
    /// Peer's headers chain has too little work to help us sync.
    InsufficientWork,
    /// Peer stalled the initial headers sync.
    HeadersSyncTimeout,
    /// Peer never demonstrated tip-level chain work.
    ChainSyncTimeout,
    /// Peer is blocking the block download window.
    StallingBlockDownload,
    /// Peer sat on a block request for too long.
    BlockDownloadTimeout,
    /// Peer was chosen as the least useful extra outbound connection.
    ExtraOutboundPeer,
    /// Peer crossed the ban threshold.
    Banned,
    /// Peer sent bloom traffic without us offering the service.
    NoBloomService,
    /// Peer requested our mempool without being entitled to it.
    MempoolRequestDenied,
    /// One-shot connection served its purpose.
    AddressesDelivered,
    /// Feeler connection served its purpose.
    Feeler,
    /// Disconnected by external command.
    Command,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PeerMagic(magic) => write!(f, "invalid message start {:x}", magic),
            Self::ObsoleteVersion(v) => write!(f, "obsolete protocol version {}", v),
            Self::PeerServices(s) => write!(f, "missing required services (offered {})", s),
            Self::SelfConnection => write!(f, "connected to self"),
            Self::InvalidChain => write!(f, "announced an invalid chain"),
            Self::InsufficientWork => write!(f, "headers chain has insufficient work"),
            Self::HeadersSyncTimeout => write!(f, "headers sync timed out"),
            Self::ChainSyncTimeout => write!(f, "chain sync timed out"),
            Self::StallingBlockDownload => write!(f, "stalling block download"),
            Self::BlockDownloadTimeout => write!(f, "block download timed out"),
            Self::ExtraOutboundPeer => write!(f, "extra outbound peer"),
            Self::Banned => write!(f, "misbehavior threshold exceeded"),
            Self::NoBloomService => write!(f, "bloom service not offered"),
            Self::MempoolRequestDenied => write!(f, "mempool request denied"),
            Self::AddressesDelivered => write!(f, "one-shot addresses delivered"),
            Self::Feeler => write!(f, "feeler complete"),
            Self::Command => write!(f, "external command"),
        }
    }
}

/// Peer whitelist. Whitelisted peers are spared bans and, depending on
/// configuration, relay and fee filtering restrictions.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    /// Trusted addresses.
    pub addr: std::collections::HashSet<std::net::IpAddr>,
    /// Trusted user agents.
    pub user_agent: std::collections::HashSet<String>,
}

impl Whitelist {
    fn contains(&self, addr: &std::net::IpAddr, user_agent: &str) -> bool {
        self.addr.contains(addr) || self.user_agent.contains(user_agent)
    }
}

/// Configured limits.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Target number of outbound connections; more are considered extra.
    pub target_outbound_peers: usize,
    /// Misbehavior score at which peers are banned.
    pub ban_threshold: u32,
    /// Mempool size assumed when computing the fee floor, in bytes.
    pub max_mempool_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            target_outbound_peers: 8,
            ban_threshold: DEFAULT_BANSCORE_THRESHOLD,
            max_mempool_bytes: 300_000_000,
        }
    }
}

/// State machine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Network we are connected to.
    pub network: Network,
    /// Services we offer.
    pub services: ServiceFlags,
    /// Services we require of outbound peers.
    pub required_services: ServiceFlags,
    /// Our protocol version.
    pub protocol_version: u32,
    /// Our user agent.
    pub user_agent: &'static str,
    /// Whether we relay transactions. `false` is blocks-only mode.
    pub relay: bool,
    /// Peer whitelist.
    pub whitelist: Whitelist,
    /// Whether whitelisted peers may relay transactions even in
    /// blocks-only mode.
    pub whitelist_relay: bool,
    /// Whether transactions from whitelisted peers are relayed even
    /// when filtered out.
    pub whitelist_force_relay: bool,
    /// Whether to send `feefilter` messages.
    pub fee_filter: bool,
    /// Minimum relay fee rate, in satoshis per kilobyte.
    pub min_relay_fee: u64,
    /// Drop one in this many received messages, for testing. Zero
    /// disables.
    pub drop_messages_test: u64,
    /// Configured limits.
    pub limits: Limits,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: Network::default(),
            services: ServiceFlags::NETWORK | ServiceFlags::WITNESS,
            required_services: ServiceFlags::NETWORK,
            protocol_version: PROTOCOL_VERSION,
            user_agent: USER_AGENT,
            relay: true,
            whitelist: Whitelist::default(),
            whitelist_relay: true,
            whitelist_force_relay: true,
            fee_filter: true,
            min_relay_fee: 1000,
            drop_messages_test: 0,
            limits: Limits::default(),
        }
    }
}

impl Config {
    /// Construct a configuration for the given network.
    pub fn from(network: Network) -> Self {
        Self {
            network,
            ..Self::default()
        }
    }
}

/// A command or request sent to the state machine by the embedding node.
#[derive(Debug)]
pub enum Command {
    /// Announce one of our own transactions; replies with the peers it
    /// was queued for.
    SubmitTransaction(Transaction, chan::Sender<Vec<PeerId>>),
    /// Queue an out-of-schedule ping to a peer.
    QueuePing(PeerId),
    /// Query a peer's protocol statistics.
    GetNodeStats(PeerId, chan::Sender<Option<NodeStateStats>>),
    /// Disconnect a peer.
    Disconnect(PeerId),
}

pub(crate) fn block_inv(hash: BlockHash, witness: bool) -> Inventory {
    if witness {
        Inventory::WitnessBlock(hash)
    } else {
        Inventory::Block(hash)
    }
}

pub(crate) fn tx_inv(txid: Txid, witness: bool) -> Inventory {
    if witness {
        Inventory::WitnessTransaction(txid)
    } else {
        Inventory::Transaction(txid)
    }
}

fn command(cmd: &'static str) -> CommandString {
    CommandString::try_from_static(cmd).expect("command fits in twelve bytes")
}

fn reject_reason(code: u8) -> RejectReason {
    match code {
        REJECT_MALFORMED => RejectReason::Malformed,
        REJECT_OBSOLETE => RejectReason::Obsolete,
        REJECT_DUPLICATE => RejectReason::Duplicate,
        REJECT_NONSTANDARD => RejectReason::NonStandard,
        _ => RejectReason::Invalid,
    }
}

/// The peer-logic state machine. Parametrized over the chain engine,
/// the mempool and the address store.
#[derive(Debug)]
pub struct StateMachine<T, M, A> {
    /// Chain engine.
    chain: T,
    /// Transaction mempool.
    mempool: M,
    /// Configuration.
    config: Config,
    /// Network-adjusted clock.
    clock: AdjustedTime<PeerId>,
    /// The per-peer state table.
    nodes: NodeStates,
    /// Address exchange and relay.
    addrmgr: AddressManager<A, Outbox>,
    /// Headers-first synchronization.
    syncmgr: SyncManager<Outbox>,
    /// Block download scheduling.
    blockmgr: BlockManager<Outbox>,
    /// Inventory relay and serving.
    invmgr: InventoryManager<Outbox>,
    /// Latency probes.
    pingmgr: PingManager<Outbox>,
    /// Random number generator.
    rng: fastrand::Rng,
    /// Output queue.
    outbox: Outbox,
    next_stale_tip_check: Option<LocalTime>,
    requested_extra_outbound: bool,
}

impl<T, M, A> Iterator for StateMachine<T, M, A> {
    type Item = Io;

    fn next(&mut self) -> Option<Io> {
        self.outbox.next()
    }
}

impl<T: Chain, M: Mempool, A: AddressSource> StateMachine<T, M, A> {
    /// Construct a new state machine.
    pub fn new(chain: T, mempool: M, addresses: A, rng: fastrand::Rng, config: Config) -> Self {
        let outbox = Outbox::new(config.protocol_version);
        let spacing = config.network.target_spacing();

        Self {
            nodes: NodeStates::new(config.limits.ban_threshold, &rng),
            addrmgr: AddressManager::new(addresses, rng.clone(), outbox.clone()),
            syncmgr: SyncManager::new(spacing, outbox.clone()),
            blockmgr: BlockManager::new(spacing, outbox.clone()),
            invmgr: InventoryManager::new(config.min_relay_fee, rng.clone(), outbox.clone()),
            pingmgr: PingManager::new(rng.clone(), outbox.clone()),
            chain,
            mempool,
            config,
            clock: AdjustedTime::default(),
            rng,
            outbox,
            next_stale_tip_check: None,
            requested_extra_outbound: false,
        }
    }

    /// Initialize the machine. Called once, before any input.
    pub fn initialize(&mut self, time: LocalTime) {
        self.clock.set_local_time(time);
        self.outbox.event(Event::Initializing);
        self.next_stale_tip_check = Some(time + STALE_CHECK_INTERVAL);
        self.outbox.wakeup(EXTRA_PEER_CHECK_INTERVAL);
        self.outbox.event(Event::Ready {
            height: self.chain.tip_height(),
            time,
        });
    }

    /// Advance the machine's clock.
    pub fn tick(&mut self, now: LocalTime) {
        self.clock.set_local_time(now);
    }

    /// Access the chain engine.
    pub fn chain(&self) -> &T {
        &self.chain
    }

    /// Mutable access to the chain engine, for the embedding node's own
    /// imports.
    pub fn chain_mut(&mut self) -> &mut T {
        &mut self.chain
    }

    /// Access the mempool.
    pub fn mempool(&self) -> &M {
        &self.mempool
    }

    /// Mutable access to the mempool.
    pub fn mempool_mut(&mut self) -> &mut M {
        &mut self.mempool
    }

    /// Drain the output queue.
    pub fn drain(&mut self) -> output::Drain {
        self.outbox.drain()
    }

    /// Per-peer protocol statistics.
    pub fn node_state_stats(&self, id: PeerId) -> Option<NodeStateStats> {
        self.nodes.stats(id, &self.chain)
    }

    /// Process an external command.
    pub fn command(&mut self, cmd: Command) {
        debug!("Received command: {:?}", cmd);

        match cmd {
            Command::SubmitTransaction(tx, reply) => {
                let peers = self.invmgr.submit(tx);
                reply.send(peers).ok();
            }
            Command::QueuePing(id) => {
                self.pingmgr.queue_ping(id);
            }
            Command::GetNodeStats(id, reply) => {
                reply.send(self.node_state_stats(id)).ok();
            }
            Command::Disconnect(id) => {
                self.disconnect(id, DisconnectReason::Command);
            }
        }
    }

    ///////////////////////////////////////////////////////////////////
    // Connection lifecycle
    ///////////////////////////////////////////////////////////////////

    /// Called when the connection manager establishes a connection.
    /// Outbound connections get the version push right away.
    pub fn peer_connected(&mut self, conn: ConnectInfo) {
        let now = self.clock.local_time();
        let mut conn = conn;

        if self.config.whitelist.contains(&conn.addr.ip(), "") {
            conn.whitelisted = true;
        }
        let local_nonce = self.rng.u64(..);

        self.nodes.insert(&conn, local_nonce, now);
        self.addrmgr
            .peer_connected(conn.id, conn.addr, conn.link, conn.one_shot, now);
        self.invmgr
            .peer_connected(conn.id, conn.link, conn.whitelisted, now);

        info!("peer={}: Connected ({:?})", conn.id, conn.link);

        if conn.link.is_outbound() {
            let version =
                self.version(conn.addr, conn.local_addr, local_nonce, self.chain.tip_height());
            self.outbox
                .message(conn.id, NetworkMessage::Version(version));
        }
    }

    /// Called when a peer's connection goes away. Returns whether the
    /// address manager should refresh the address's connection time.
    pub fn peer_disconnected(&mut self, id: PeerId) -> bool {
        let update = self.nodes.remove(id);

        self.mempool.remove_orphans_for_peer(id);
        self.addrmgr.peer_disconnected(id);
        self.invmgr.peer_disconnected(id);
        self.pingmgr.peer_disconnected(id);

        update
    }

    fn disconnect(&mut self, id: PeerId, reason: DisconnectReason) {
        if let Some(state) = self.nodes.get_mut(id) {
            if !state.disconnecting {
                state.disconnecting = true;
                self.outbox.disconnect(id, reason);
            }
        }
    }

    fn misbehave(&mut self, id: PeerId, score: u32) {
        if score == 0 {
            return;
        }
        self.nodes.misbehaving(id, score);

        if let Some(state) = self.nodes.get(id) {
            self.outbox.event(Event::Misbehaved {
                peer: id,
                score,
                total: state.misbehavior,
            });
        }
    }

    fn version(
        &self,
        addr: std::net::SocketAddr,
        local_addr: std::net::SocketAddr,
        nonce: u64,
        start_height: Height,
    ) -> VersionMessage {
        VersionMessage {
            // Our highest supported protocol version.
            version: self.config.protocol_version,
            // Local services.
            services: self.config.services,
            // Local time.
            timestamp: self.clock.block_time() as i64,
            // Receiver address, as perceived by us.
            receiver: Address::new(&addr, ServiceFlags::NONE),
            // Local address (unreliable) and local services.
            sender: Address::new(&local_addr, self.config.services),
            // Nonce, to detect connections to self.
            nonce,
            // Our user agent.
            user_agent: self.config.user_agent.to_owned(),
            // Our best height.
            start_height: start_height as i32,
            // Whether we want transaction inventories at all.
            relay: self.config.relay,
        }
    }

    ///////////////////////////////////////////////////////////////////
    // Inbound dispatch
    ///////////////////////////////////////////////////////////////////

    /// Process a message received from a peer.
    pub fn message_received(&mut self, id: PeerId, msg: RawNetworkMessage, interrupt: &Interrupt) {
        if self.config.drop_messages_test > 0 && self.rng.u64(..self.config.drop_messages_test) == 0
        {
            debug!("dropping received message (drop-messages test)");
            return;
        }
        if msg.magic != self.config.network.magic() {
            warn!(
                "peer={}: invalid message start {:x}",
                id, msg.magic
            );
            self.disconnect(id, DisconnectReason::PeerMagic(msg.magic));
            return;
        }
        if !self.nodes.contains(id) {
            debug!("peer={}: received {:?} from unknown peer", id, msg.payload.cmd());
            return;
        }
        debug!("peer={}: received {:?}", id, msg.payload.cmd());

        self.process_payload(id, msg.payload, interrupt);
        self.send_rejects_and_check_banned(id);
    }

    /// Tell a peer that one of its messages could not be parsed. Called
    /// by the embedding node when frame decoding fails.
    pub fn message_malformed(&mut self, id: PeerId, command_name: &str) {
        self.outbox.message(
            id,
            NetworkMessage::Reject(Reject {
                message: Cow::Owned(command_name.to_owned()),
                ccode: RejectReason::Malformed,
                reason: Cow::Borrowed("error parsing message"),
                hash: bitcoin::hashes::sha256d::Hash::all_zeros(),
            }),
        );
    }

    fn peer_version(&self, id: PeerId) -> u32 {
        self.nodes.get(id).map_or(0, |s| s.version)
    }

    fn process_payload(&mut self, id: PeerId, payload: NetworkMessage, interrupt: &Interrupt) {
        let version = self.peer_version(id);

        // Peers that became obsolete mid-connection (a fork activated)
        // are cut loose on their next message.
        let min_version = self.chain.min_peer_version().max(MIN_PEER_PROTO_VERSION);
        if version != 0 && version < min_version {
            self.push_reject(
                id,
                "version",
                REJECT_OBSOLETE,
                format!("Version must be {} or greater", min_version),
            );
            self.disconnect(id, DisconnectReason::ObsoleteVersion(version));
            return;
        }

        // Bloom traffic without the bloom service on offer.
        if !self.config.services.has(ServiceFlags::BLOOM)
            && matches!(
                payload,
                NetworkMessage::FilterLoad(_) | NetworkMessage::FilterAdd(_)
            )
        {
            if version >= NO_BLOOM_VERSION {
                self.misbehave(id, 100);
            } else {
                self.disconnect(id, DisconnectReason::NoBloomService);
            }
            return;
        }

        match payload {
            NetworkMessage::Reject(reject) => {
                debug!(
                    "peer={}: reject {} code {:?}: {}",
                    id, reject.message, reject.ccode, reject.reason
                );
            }
            NetworkMessage::Version(msg) => self.handle_version(id, msg),
            payload if version == 0 => {
                // Must have a version message before anything else.
                debug!("peer={}: {:?} before version", id, payload.cmd());
                self.misbehave(id, 1);
            }
            NetworkMessage::Verack => self.handle_verack(id),
            payload if !self.nodes.get(id).map_or(false, |s| s.successfully_connected) => {
                // Must have a verack before anything else.
                debug!("peer={}: {:?} before verack", id, payload.cmd());
                self.misbehave(id, 1);
            }
            NetworkMessage::GetAddr => self.addrmgr.received_getaddr(id),
            NetworkMessage::Addr(addrs) => self.handle_addr(id, addrs, interrupt),
            NetworkMessage::SendHeaders => {
                if let Some(state) = self.nodes.get_mut(id) {
                    state.prefer_headers = true;
                }
            }
            NetworkMessage::SendCmpct(msg) => self.handle_sendcmpct(id, msg),
            NetworkMessage::Ping(nonce) => self.pingmgr.received_ping(id, nonce),
            NetworkMessage::Pong(nonce) => {
                self.pingmgr
                    .received_pong(id, Some(nonce), self.clock.local_time())
            }
            NetworkMessage::FilterLoad(msg) => {
                let score = self.invmgr.received_filterload(id, msg);
                self.misbehave(id, score);
            }
            NetworkMessage::FilterAdd(msg) => {
                let score = self.invmgr.received_filteradd(id, &msg.data);
                self.misbehave(id, score);
            }
            NetworkMessage::FilterClear => self.invmgr.received_filterclear(id),
            NetworkMessage::FeeFilter(rate) => self.invmgr.received_feefilter(id, rate),
            NetworkMessage::MemPool => self.handle_mempool(id),
            NetworkMessage::GetBlocks(msg) => self.handle_getblocks(id, msg),
            NetworkMessage::Inv(invs) => self.handle_inv(id, invs, interrupt),
            NetworkMessage::GetHeaders(msg) => self.handle_getheaders(id, msg),
            NetworkMessage::Headers(headers) => self.handle_headers(id, headers),
            NetworkMessage::GetData(invs) => self.handle_getdata(id, invs, interrupt),
            NetworkMessage::Block(block) => self.handle_block(id, block),
            NetworkMessage::Tx(tx) => self.handle_tx(id, tx),
            NetworkMessage::GetBlockTxn(GetBlockTxn { txs_request }) => {
                self.handle_getblocktxn(id, txs_request)
            }
            NetworkMessage::BlockTxn(msg) => self.handle_blocktxn(id, msg.transactions),
            NetworkMessage::CmpctBlock(msg) => self.handle_cmpctblock(id, msg.compact_block),
            NetworkMessage::NotFound(_) => {
                // We don't act on notfound, but it's ours too, so don't
                // log it as unknown.
            }
            NetworkMessage::Unknown { command, payload } => match command.to_string().as_str() {
                "checkpoint" => self.handle_checkpoint(id, &payload),
                "get_checkpoint" => self.handle_get_checkpoint(id, &payload),
                other => {
                    // Ignore unknown commands for extensibility.
                    debug!("peer={}: unknown command {:?}", id, other);
                }
            },
            payload => {
                debug!("peer={}: ignoring {:?}", id, payload.cmd());
            }
        }
    }

    fn push_reject(&mut self, id: PeerId, message: &'static str, code: u8, reason: String) {
        self.outbox.message(
            id,
            NetworkMessage::Reject(Reject {
                message: Cow::Borrowed(message),
                ccode: reject_reason(code),
                reason: Cow::Owned(reason),
                hash: bitcoin::hashes::sha256d::Hash::all_zeros(),
            }),
        );
    }

    fn handle_version(&mut self, id: PeerId, msg: VersionMessage) {
        let now = self.clock.local_time();

        if self.peer_version(id) != 0 {
            // Each connection gets exactly one version message.
            self.push_reject(
                id,
                "version",
                REJECT_DUPLICATE,
                "Duplicate version message".to_owned(),
            );
            self.misbehave(id, 1);
            return;
        }
        let VersionMessage {
            version,
            services,
            timestamp,
            receiver,
            nonce,
            user_agent,
            start_height,
            relay,
            ..
        } = msg;

        let (link, addr, local_addr, feeler) = match self.nodes.get(id) {
            Some(s) => (s.link, s.addr, s.local_addr, s.feeler),
            None => return,
        };

        if link.is_outbound() {
            self.addrmgr.store_mut().set_services(addr, services);
        }
        if !services.has(self.config.required_services) {
            debug!(
                "peer={} does not offer the expected services ({} offered); disconnecting",
                id, services
            );
            self.push_reject(
                id,
                "version",
                REJECT_NONSTANDARD,
                format!("Expected to offer services {}", self.config.required_services),
            );
            self.disconnect(id, DisconnectReason::PeerServices(services));
            return;
        }
        let min_version = self.chain.min_peer_version().max(MIN_PEER_PROTO_VERSION);
        if version < min_version {
            warn!("peer={} using obsolete version {}; disconnecting", id, version);
            self.push_reject(
                id,
                "version",
                REJECT_OBSOLETE,
                format!("Version must be {} or greater", min_version),
            );
            self.disconnect(id, DisconnectReason::ObsoleteVersion(version));
            return;
        }
        // Inbound connections echoing one of our own nonces mean we
        // connected to ourselves. One direction suffices: a
        // self-connection shows both.
        if link.is_inbound()
            && self
                .nodes
                .iter()
                .any(|(_, s)| s.link.is_outbound() && s.local_nonce == nonce)
        {
            warn!("connected to self at {}, disconnecting", addr);
            self.disconnect(id, DisconnectReason::SelfConnection);
            return;
        }
        if link.is_inbound() && addrmgr::is_routable(&receiver) {
            // Note the address the peer sees us as.
            self.addrmgr.record_local(&receiver);
        }
        // Be shy: answer an inbound version before sending ours.
        if link.is_inbound() {
            let local_nonce = self.nodes.get(id).map_or(0, |s| s.local_nonce);
            let height = self.chain.tip_height();
            let version = self.version(addr, local_addr, local_nonce, height);
            self.outbox.message(id, NetworkMessage::Version(version));
        }
        self.outbox.message(id, NetworkMessage::Verack);

        let whitelisted_agent = self.config.whitelist.contains(&addr.ip(), &user_agent);

        if let Some(state) = self.nodes.get_mut(id) {
            state.version = version;
            state.send_version = version.min(PROTOCOL_VERSION);
            state.services = services;
            state.starting_height = start_height;
            state.client = !services.has(ServiceFlags::NETWORK);
            state.have_witness = services.has(ServiceFlags::WITNESS);
            if whitelisted_agent {
                state.whitelisted = true;
            }
        }
        info!(
            "receive version message: {}: version {}, blocks={}, peer={}",
            user_agent, version, start_height, id
        );

        self.invmgr.peer_negotiated(id, version, relay);
        if whitelisted_agent {
            self.invmgr.set_whitelisted(id);
        }
        self.addrmgr.peer_negotiated(id, version);
        self.nodes.update_preferred_download(id);

        if link.is_outbound() {
            // Advertise our address, and harvest theirs.
            if !self.chain.is_initial_block_download() {
                self.addrmgr.advertise_local(id);
            }
            if self.addrmgr.wants_addresses(id) {
                self.addrmgr.request_addresses(id);
            }
            self.addrmgr.peer_verified(id, services);
        }

        let offset = timestamp - now.block_time() as i64;
        self.clock.record_offset(id, offset);

        if feeler {
            // Feelers exist only to verify the address is alive.
            self.disconnect(id, DisconnectReason::Feeler);
        }
    }

    fn handle_verack(&mut self, id: PeerId) {
        let (version, link) = match self.nodes.get(id) {
            Some(s) => (s.version, s.link),
            None => return,
        };
        if link.is_outbound() {
            // The connection is confirmed working; worth remembering.
            if let Some(state) = self.nodes.get_mut(id) {
                state.currently_connected = true;
            }
        }
        if version >= SENDHEADERS_VERSION {
            // Ask for headers announcements rather than invs. Announced
            // even to non-network peers, since pruned nodes announce
            // blocks too.
            self.outbox.message(id, NetworkMessage::SendHeaders);
        }
        if version >= SHORT_IDS_BLOCKS_VERSION {
            // Offer to serve compact blocks, in both flavors if we can
            // do witness; we do not request compact announcements here.
            if self.config.services.has(ServiceFlags::WITNESS) {
                self.outbox.message(
                    id,
                    NetworkMessage::SendCmpct(SendCmpct {
                        send_compact: false,
                        version: 2,
                    }),
                );
            }
            self.outbox.message(
                id,
                NetworkMessage::SendCmpct(SendCmpct {
                    send_compact: false,
                    version: 1,
                }),
            );
        }
        if let Some(state) = self.nodes.get_mut(id) {
            state.successfully_connected = true;
        }
        self.pingmgr.peer_negotiated(id, version);
    }

    fn handle_sendcmpct(&mut self, id: PeerId, msg: SendCmpct) {
        let witness_node = self.config.services.has(ServiceFlags::WITNESS);

        if msg.version == 1 || (witness_node && msg.version == 2) {
            if let Some(state) = self.nodes.get_mut(id) {
                // The first sendcmpct locks in the witness flavor we
                // serve this peer.
                if !state.provides_header_and_ids {
                    state.provides_header_and_ids = true;
                    state.wants_cmpct_witness = msg.version == 2;
                }
                if state.wants_cmpct_witness == (msg.version == 2) {
                    // Ignore later-version announcements.
                    state.prefer_header_and_ids = msg.send_compact;
                }
                if !state.supports_desired_cmpct_version {
                    state.supports_desired_cmpct_version = if witness_node {
                        msg.version == 2
                    } else {
                        msg.version == 1
                    };
                }
            }
        }
    }

    fn handle_addr(
        &mut self,
        id: PeerId,
        addrs: Vec<(u32, Address)>,
        interrupt: &Interrupt,
    ) {
        let result = self.addrmgr.received_addr(
            id,
            addrs,
            self.config.required_services,
            self.clock.local_time(),
            self.clock.block_time(),
            interrupt,
        );
        match result {
            Ok(one_shot) => {
                if one_shot {
                    self.disconnect(id, DisconnectReason::AddressesDelivered);
                }
            }
            Err(score) => self.misbehave(id, score),
        }
    }

    fn handle_mempool(&mut self, id: PeerId) {
        let whitelisted = self.nodes.get(id).map_or(false, |s| s.whitelisted);

        if !self.config.services.has(ServiceFlags::BLOOM) && !whitelisted {
            debug!("peer={}: mempool request with bloom disabled, disconnecting", id);
            self.disconnect(id, DisconnectReason::MempoolRequestDenied);
            return;
        }
        self.invmgr.received_mempool(id);
    }

    fn handle_getblocks(&mut self, id: PeerId, msg: GetBlocksMessage) {
        let hashes =
            self.chain
                .locate_blocks(&msg.locator_hashes, msg.stop_hash, 500);

        for hash in &hashes {
            self.invmgr.push_block_inv(id, *hash);
        }
        if hashes.len() >= 500 {
            if let Some(last) = hashes.last() {
                self.invmgr.set_hash_continue(id, *last);
            }
        }
    }

    fn handle_inv(&mut self, id: PeerId, invs: Vec<Inventory>, interrupt: &Interrupt) {
        if invs.len() > MAX_INV_SZ {
            warn!("peer={}: message inv size() = {}", id, invs.len());
            self.misbehave(id, 20);
            return;
        }
        let now = self.clock.local_time();
        let (whitelisted, have_witness) = match self.nodes.get(id) {
            Some(s) => (s.whitelisted, s.have_witness),
            None => return,
        };
        let mut blocks_only = !self.config.relay;

        // Whitelisted peers may relay in blocks-only mode, if configured.
        if whitelisted && self.config.whitelist_relay {
            blocks_only = false;
        }
        let witness_tx = self.config.services.has(ServiceFlags::WITNESS) && have_witness;

        for inv in invs {
            if interrupt.is_set() {
                return;
            }
            match inv {
                Inventory::Block(hash)
                | Inventory::WitnessBlock(hash)
                | Inventory::CompactBlock(hash) => {
                    self.syncmgr
                        .received_block_inv(&mut self.nodes, id, hash, &self.chain);
                }
                Inventory::Transaction(txid) | Inventory::WitnessTransaction(txid) => {
                    self.invmgr.transaction_known(id, txid);

                    if blocks_only {
                        debug!(
                            "transaction ({}) inv sent in violation of protocol peer={}",
                            txid, id
                        );
                    } else if !self.mempool.contains(&txid)
                        && !self.chain.is_importing()
                        && !self.chain.is_reindexing()
                        && !self.chain.is_initial_block_download()
                    {
                        self.invmgr.ask_for(id, tx_inv(txid, witness_tx), now);
                    }
                }
                _ => {}
            }
        }
    }

    fn handle_getheaders(&mut self, id: PeerId, msg: GetHeadersMessage) {
        let whitelisted = self.nodes.get(id).map_or(false, |s| s.whitelisted);

        if self.chain.is_initial_block_download() && !whitelisted {
            debug!("Ignoring getheaders from peer={} during initial download", id);
            return;
        }
        let entries =
            self.chain
                .locate_headers(&msg.locator_hashes, msg.stop_hash, MAX_HEADERS_RESULTS);
        let headers = entries
            .iter()
            .map(|e| self.chain.header(*e))
            .collect::<Vec<_>>();
        let best_sent = entries.last().copied().unwrap_or_else(|| self.chain.tip());

        if let Some(state) = self.nodes.get_mut(id) {
            state.best_header_sent = Some(best_sent);
        }
        self.outbox.message(id, NetworkMessage::Headers(headers));
    }

    fn handle_headers(&mut self, id: PeerId, headers: Vec<bitcoin::BlockHeader>) {
        if self.chain.is_importing() || self.chain.is_reindexing() {
            return;
        }
        if headers.len() > MAX_HEADERS_RESULTS {
            warn!("peer={}: headers message size = {}", id, headers.len());
            self.misbehave(id, 20);
            return;
        }
        // An empty batch means the peer has nothing more for us.
        let headers = match NonEmpty::from_vec(headers) {
            Some(headers) => Vec::from(headers),
            None => return,
        };
        // Headers received via a headers message should reflect the
        // chain the peer is on; a known-invalid header forfeits an
        // outbound slot.
        let punish = self
            .nodes
            .get(id)
            .map_or(false, |s| s.link.is_outbound() && !s.manual);
        let our_witness = self.config.services.has(ServiceFlags::WITNESS);

        if let Some(reason) = self.syncmgr.received_headers(
            &mut self.nodes,
            id,
            &headers,
            &mut self.chain,
            our_witness,
            punish,
            self.clock.local_time(),
            self.clock.block_time(),
        ) {
            self.disconnect(id, reason);
        }
    }

    fn handle_getdata(&mut self, id: PeerId, invs: Vec<Inventory>, interrupt: &Interrupt) {
        if invs.len() > MAX_INV_SZ {
            warn!("peer={}: message getdata size() = {}", id, invs.len());
            self.misbehave(id, 20);
            return;
        }
        debug!("received getdata ({} invsz) peer={}", invs.len(), id);

        self.invmgr.received_getdata(id, &invs);
        self.invmgr
            .process_getdata(id, &self.nodes, &self.chain, &self.mempool, interrupt);
    }

    fn handle_block(&mut self, id: PeerId, block: Block) {
        if self.chain.is_importing() || self.chain.is_reindexing() {
            return;
        }
        let now = self.clock.local_time();
        let hash = block.block_hash();

        debug!("received block {} peer={}", hash, id);

        // Blocks we explicitly requested are processed even when they
        // are no candidate for a new best tip.
        let force = self.nodes.mark_block_received(&hash, now);

        self.nodes.record_block_source(hash, id, true);

        if self.chain.accept_block(block, force) {
            if let Some(state) = self.nodes.get_mut(id) {
                state.last_block_time = Some(now);
            }
        } else {
            self.nodes.clear_block_source(&hash);
        }
    }

    fn handle_tx(&mut self, id: PeerId, tx: Transaction) {
        let txid = tx.txid();

        self.invmgr.transaction_received(id, txid);

        let verdict = self.mempool.receive(id, tx);

        if !verdict.relay.is_empty() {
            self.invmgr.relay(&verdict.relay, Some(id));
        }
        if let Some((code, reason)) = verdict.reject {
            self.outbox.message(
                id,
                NetworkMessage::Reject(Reject {
                    message: Cow::Borrowed("tx"),
                    ccode: reject_reason(code),
                    reason: Cow::Owned(reason),
                    hash: txid.as_hash(),
                }),
            );
        }
        if verdict.misbehavior > 0 {
            self.misbehave(id, verdict.misbehavior);
        }
    }

    fn handle_getblocktxn(&mut self, id: PeerId, req: BlockTransactionsRequest) {
        let entry = match self.chain.lookup(&req.block_hash) {
            Some(entry) if self.chain.has_data(entry) => entry,
            _ => {
                warn!("peer={} sent us a getblocktxn for a block we don't have", id);
                self.misbehave(id, 100);
                return;
            }
        };
        let block = match self.chain.read_block(entry) {
            Some(block) => block,
            None => return,
        };
        if self.chain.height(entry)
            < self.chain.tip_height().saturating_sub(MAX_BLOCKTXN_DEPTH)
        {
            // Deep enough that short ids won't help; answer with the
            // whole block.
            debug!(
                "peer={} sent us a getblocktxn for a block > {} deep",
                id, MAX_BLOCKTXN_DEPTH
            );
            self.outbox.message(id, NetworkMessage::Block(block));
            return;
        }
        let mut transactions = Vec::with_capacity(req.indexes.len());

        for index in &req.indexes {
            match block.txdata.get(*index as usize) {
                Some(tx) => transactions.push(tx.clone()),
                None => {
                    warn!("peer={} sent us a getblocktxn with out-of-bounds tx indices", id);
                    self.misbehave(id, 100);
                    return;
                }
            }
        }
        self.outbox.message(
            id,
            NetworkMessage::BlockTxn(bitcoin::network::message_compact_blocks::BlockTxn {
                transactions: BlockTransactions {
                    block_hash: req.block_hash,
                    transactions,
                },
            }),
        );
    }

    fn handle_blocktxn(&mut self, id: PeerId, txn: BlockTransactions) {
        if self.chain.is_importing() || self.chain.is_reindexing() {
            return;
        }
        let now = self.clock.local_time();
        let hash = txn.block_hash;

        if self.nodes.in_flight_with(&hash) != Some(id) {
            debug!(
                "peer={} sent us block transactions for block we weren't expecting",
                id
            );
            return;
        }
        let filled = {
            let partial = self
                .nodes
                .get_mut(id)
                .and_then(|s| s.queued_mut(&hash))
                .and_then(|q| q.partial.as_ref());

            match partial {
                Some(partial) => partial.fill(txn.transactions),
                None => {
                    debug!(
                        "peer={} sent us block transactions for block we weren't expecting",
                        id
                    );
                    return;
                }
            }
        };
        match filled {
            Err(CmpctError::Invalid) => {
                // Reset in-flight state, in case of whitelist.
                self.nodes.mark_block_received(&hash, now);
                self.misbehave(id, 100);
                warn!(
                    "peer={} sent us invalid compact block/non-matching block transactions",
                    id
                );
            }
            Err(CmpctError::Failed) => {
                // Might have collided; fall back to getdata.
                let witness = self.fetch_witness(id);
                self.outbox
                    .message(id, NetworkMessage::GetData(vec![block_inv(hash, witness)]));
            }
            Ok(block) => {
                self.nodes.mark_block_received(&hash, now);
                // Compact blocks are allowed to be relayed on header
                // validation alone; the sender doesn't answer for the
                // block body.
                self.nodes.record_block_source(hash, id, false);

                // We requested the block, so force processing even if it
                // is no candidate for a new best tip.
                if self.chain.accept_block(block, true) {
                    if let Some(state) = self.nodes.get_mut(id) {
                        state.last_block_time = Some(now);
                    }
                } else {
                    self.nodes.clear_block_source(&hash);
                }
            }
        }
    }

    fn fetch_witness(&self, id: PeerId) -> bool {
        self.config.services.has(ServiceFlags::WITNESS)
            && self.nodes.get(id).map_or(false, |s| s.have_witness)
    }

    fn handle_cmpctblock(&mut self, id: PeerId, cmpct: HeaderAndShortIds) {
        if self.chain.is_importing() || self.chain.is_reindexing() {
            return;
        }
        let now = self.clock.local_time();
        let hash = cmpct.header.block_hash();

        // An unknown parent can't be validated; ask for the headers in
        // between rather than scoring the peer.
        if self.chain.lookup(&cmpct.header.prev_blockhash).is_none() {
            if !self.chain.is_initial_block_download() {
                self.outbox.get_headers(
                    id,
                    (
                        self.chain.locator(self.chain.best_header()),
                        BlockHash::all_zeros(),
                    ),
                );
            }
            return;
        }
        let received_new = self.chain.lookup(&hash).is_none();

        let entry = match self.chain.accept_headers(&[cmpct.header]) {
            Ok(entry) => entry,
            Err(err) => {
                if err.dos > 0 {
                    self.misbehave(id, err.dos);
                }
                warn!("peer={} sent us invalid header via cmpctblock", id);
                return;
            }
        };
        self.nodes
            .update_block_availability(id, self.chain.hash(entry), &self.chain);

        if received_new && self.chain.work(entry) > self.chain.work(self.chain.tip()) {
            if let Some(state) = self.nodes.get_mut(id) {
                state.last_block_announcement = Some(now);
            }
        }

        if self.chain.has_data(entry) {
            // Nothing to do here.
            return;
        }
        let holder = self.nodes.in_flight_with(&hash);
        let already_in_flight = holder.is_some();
        let witness = self.fetch_witness(id);

        if self.chain.work(entry) <= self.chain.work(self.chain.tip())
            || self.chain.has_txns(entry)
        {
            // We know something better, or had this block and pruned it;
            // the mempool won't help reconstruct, so fall back to a
            // plain block request if we asked this peer.
            if holder == Some(id) {
                self.outbox
                    .message(id, NetworkMessage::GetData(vec![block_inv(hash, witness)]));
            }
            return;
        }
        // Not close to the tip yet; let parallel block fetch work its
        // magic.
        if !already_in_flight && !self.syncmgr.can_direct_fetch(&self.chain, self.clock.block_time())
        {
            return;
        }
        let supports_cmpct = self
            .nodes
            .get(id)
            .map_or(false, |s| s.supports_desired_cmpct_version);

        if self.chain.witness_enabled(self.chain.prev(entry)) && !supports_cmpct {
            // Don't bother processing compact blocks from v1 peers after
            // witness activation.
            return;
        }
        let use_wtxid = self.config.services.has(ServiceFlags::WITNESS);

        // Be conservative about DoS potential: only reconstruct blocks
        // that extend, or nearly extend, our tip.
        if self.chain.height(entry) <= self.chain.tip_height() + 2 {
            let room = self
                .nodes
                .get(id)
                .map_or(false, |s| s.in_flight_count() < MAX_BLOCKS_IN_TRANSIT_PER_PEER);

            if (!already_in_flight && room) || holder == Some(id) {
                let status = self.nodes.mark_block_in_flight(id, hash, Some(entry), now);

                if status == Some(InFlight::AlreadyQueued)
                    && self
                        .nodes
                        .get(id)
                        .and_then(|s| s.queued(&hash))
                        .map_or(false, |q| q.partial.is_some())
                {
                    debug!("peer={} sent us compact block we were already syncing", id);
                    return;
                }
                let partial = match PartialBlock::new(&cmpct, &self.mempool, use_wtxid) {
                    Ok(partial) => partial,
                    Err(CmpctError::Invalid) => {
                        // Reset in-flight state, in case of whitelist.
                        self.nodes.mark_block_received(&hash, now);
                        self.misbehave(id, 100);
                        warn!("peer={} sent us invalid compact block", id);
                        return;
                    }
                    Err(CmpctError::Failed) => {
                        // Duplicate short ids; the block is in flight
                        // now, so just request it whole.
                        self.outbox.message(
                            id,
                            NetworkMessage::GetData(vec![block_inv(hash, witness)]),
                        );
                        return;
                    }
                };
                let missing = partial.missing();

                if let Some(queued) = self.nodes.get_mut(id).and_then(|s| s.queued_mut(&hash)) {
                    queued.partial = Some(partial);
                }
                if missing.is_empty() {
                    // Everything came out of the mempool; complete via
                    // the blocktxn path with an empty answer.
                    self.handle_blocktxn(
                        id,
                        BlockTransactions {
                            block_hash: hash,
                            transactions: vec![],
                        },
                    );
                } else {
                    self.outbox.message(
                        id,
                        NetworkMessage::GetBlockTxn(GetBlockTxn {
                            txs_request: BlockTransactionsRequest {
                                block_hash: hash,
                                indexes: missing,
                            },
                        }),
                    );
                }
            } else {
                // The block is in flight elsewhere, or this peer is
                // full. Try an optimistic mempool-only reconstruction;
                // it may complete without any round trip.
                let reconstructed = PartialBlock::new(&cmpct, &self.mempool, use_wtxid)
                    .ok()
                    .filter(|p| p.missing().is_empty())
                    .and_then(|p| p.fill(vec![]).ok());

                if let Some(block) = reconstructed {
                    self.nodes.record_block_source(hash, id, false);

                    if self.chain.accept_block(block, true) {
                        if let Some(state) = self.nodes.get_mut(id) {
                            state.last_block_time = Some(now);
                        }
                    } else {
                        self.nodes.clear_block_source(&hash);
                    }
                    // Clear the other peer's download state only after
                    // processing, so a malleated announcement can't be
                    // used to interfere with block relay.
                    if self.chain.is_valid(entry, ValidationLevel::Transactions) {
                        self.nodes.mark_block_received(&hash, now);
                    }
                }
            }
        } else if already_in_flight {
            // We requested this block, but it's far ahead; our mempool
            // will be useless, request it whole.
            self.outbox
                .message(id, NetworkMessage::GetData(vec![block_inv(hash, witness)]));
        } else {
            // An announcement far past our tip gets the same treatment
            // as a headers message. Compact-block announcements may
            // precede full validation, so invalidity is not punished
            // here.
            let our_witness = self.config.services.has(ServiceFlags::WITNESS);
            let headers = [cmpct.header];

            if let Some(reason) = self.syncmgr.received_headers(
                &mut self.nodes,
                id,
                &headers,
                &mut self.chain,
                our_witness,
                false,
                now,
                self.clock.block_time(),
            ) {
                self.disconnect(id, reason);
            }
        }
    }

    fn handle_checkpoint(&mut self, id: PeerId, payload: &[u8]) {
        match self.chain.receive_checkpoints(payload) {
            Ok(count) => debug!("peer={}: accepted {} checkpoint(s)", id, count),
            Err(err) => {
                debug!("peer={}: invalid checkpoint message: {}", id, err.reason);
                self.misbehave(id, err.dos);
            }
        }
    }

    fn handle_get_checkpoint(&mut self, id: PeerId, payload: &[u8]) {
        let height: i32 = match deserialize(payload) {
            Ok(height) => height,
            Err(_) => {
                self.message_malformed(id, "get_checkpoint");
                return;
            }
        };
        if let Some(data) = self.chain.checkpoints_from(height.max(0) as Height) {
            self.outbox.message(
                id,
                NetworkMessage::Unknown {
                    command: command("checkpoint"),
                    payload: data,
                },
            );
        }
    }

    ///////////////////////////////////////////////////////////////////
    // Rejects and banning
    ///////////////////////////////////////////////////////////////////

    /// Flush queued reject notifications, and act on a latched ban flag.
    /// Returns `true` when the peer was banned.
    fn send_rejects_and_check_banned(&mut self, id: PeerId) -> bool {
        let (rejects, should_ban) = match self.nodes.get_mut(id) {
            Some(state) => (std::mem::take(&mut state.rejects), state.should_ban),
            None => return false,
        };
        for BlockReject { code, reason, hash } in rejects {
            self.outbox.message(
                id,
                NetworkMessage::Reject(Reject {
                    message: Cow::Borrowed("block"),
                    ccode: reject_reason(code),
                    reason: Cow::Owned(reason),
                    hash: hash.as_hash(),
                }),
            );
        }
        if !should_ban {
            return false;
        }
        let (addr, whitelisted, manual) = match self.nodes.get_mut(id) {
            Some(state) => {
                state.should_ban = false;
                (state.addr, state.whitelisted, state.manual)
            }
            None => return false,
        };
        if whitelisted {
            warn!("not punishing whitelisted peer {}", addr);
        } else if manual {
            warn!("not punishing manually-added peer {}", addr);
        } else {
            self.disconnect(id, DisconnectReason::Banned);
            if addr.ip().is_loopback() {
                warn!("not banning local peer {}", addr);
            } else {
                self.outbox.push(Io::Ban(id));
                self.outbox.event(Event::Banned(id));
            }
        }
        true
    }

    ///////////////////////////////////////////////////////////////////
    // Outbound tick
    ///////////////////////////////////////////////////////////////////

    /// Run one send tick for a peer. The order of steps is part of the
    /// protocol's observable behavior and must not be shuffled.
    pub fn send_messages(&mut self, id: PeerId) {
        let now = self.clock.local_time();

        // Nothing goes out until the version handshake completes.
        match self.nodes.get(id) {
            Some(state) if state.successfully_connected && !state.disconnecting => {}
            _ => return,
        }
        self.pingmgr.maybe_ping(id, now);

        if self.send_rejects_and_check_banned(id) {
            return;
        }
        let ibd = self.chain.is_initial_block_download();

        // Address refresh and addr flush.
        self.addrmgr.flush(id, now, ibd);

        // Initial headers sync.
        self.syncmgr
            .maybe_start_sync(&mut self.nodes, id, &self.chain, now, self.clock.block_time());

        // Re-announce our own transactions, except while catching up,
        // when old inventory would just spam the network.
        if !ibd && !self.chain.is_reindexing() && !self.chain.is_importing() {
            self.invmgr.maybe_rebroadcast(now);
        }

        // Block announcements: headers, compact block, or inv.
        self.invmgr.announce_blocks(id, &mut self.nodes, &self.chain);

        // Inventory flush and transaction trickle.
        self.invmgr.flush_inventory(id, &mut self.mempool, now);

        // Stall and download timeouts.
        if let Some(reason) = self.blockmgr.check_timeouts(&self.nodes, id, now) {
            self.disconnect(id, reason);
            return;
        }
        // Headers sync timeout.
        if let Some(reason) = self.syncmgr.check_headers_timeout(
            &mut self.nodes,
            id,
            &self.chain,
            now,
            self.clock.block_time(),
        ) {
            self.disconnect(id, reason);
            return;
        }
        // Check that outbound peers have reasonable chains.
        if let Some(reason) =
            self.syncmgr
                .consider_eviction(&mut self.nodes, id, &self.chain, now)
        {
            self.disconnect(id, reason);
            return;
        }
        // getdata (blocks).
        let our_witness = self.config.services.has(ServiceFlags::WITNESS);
        self.blockmgr
            .request_blocks(&mut self.nodes, id, &self.chain, our_witness, now);

        // getdata (non-blocks).
        self.invmgr.drain_ask_for(id, &self.mempool, now);

        // feefilter.
        self.invmgr.maybe_send_feefilter(
            id,
            &self.mempool,
            self.config.fee_filter,
            self.config.whitelist_force_relay,
            self.config.limits.max_mempool_bytes,
            self.config.min_relay_fee,
            now,
        );
    }

    /// Timer wake-up: run the send tick for every peer and the periodic
    /// peer-eviction checks.
    pub fn received_wake(&mut self) {
        for id in self.nodes.ids() {
            self.send_messages(id);
        }
        self.check_for_stale_tip_and_evict_peers();
        self.outbox.wakeup(EXTRA_PEER_CHECK_INTERVAL);
    }

    /// Evict surplus outbound peers, and ask for an extra outbound
    /// connection while our tip looks stale. Runs on the eviction
    /// cadence; the stale-tip check itself is rate-limited further.
    pub fn check_for_stale_tip_and_evict_peers(&mut self) {
        let now = self.clock.local_time();

        self.evict_extra_outbound_peers(now);

        match self.next_stale_tip_check {
            Some(at) if now < at => {}
            _ => {
                if self.tip_may_be_stale(now) {
                    let last = self.nodes.last_tip_update().unwrap_or_default();

                    warn!(
                        "Potential stale tip detected, will try using extra outbound peer (last tip update: {})",
                        last
                    );
                    self.outbox.push(Io::TryNewOutbound(true));
                    self.outbox.event(Event::StaleTip(last));
                    self.requested_extra_outbound = true;
                } else if self.requested_extra_outbound {
                    self.outbox.push(Io::TryNewOutbound(false));
                    self.requested_extra_outbound = false;
                }
                self.next_stale_tip_check = Some(now + STALE_CHECK_INTERVAL);
            }
        }
    }

    fn tip_may_be_stale(&mut self, now: LocalTime) -> bool {
        let spacing = self.config.network.target_spacing();
        let last = match self.nodes.last_tip_update() {
            Some(last) => last,
            None => {
                self.nodes.tip_updated(now);
                return false;
            }
        };
        last < now - LocalDuration::from_secs(spacing * 3) && self.nodes.in_flight_total() == 0
    }

    fn evict_extra_outbound_peers(&mut self, now: LocalTime) {
        let candidates = self
            .nodes
            .iter()
            .filter(|(_, s)| s.is_outbound_disconnect_candidate() && !s.disconnecting)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();

        if candidates.len() <= self.config.limits.target_outbound_peers {
            return;
        }
        // Evict the outbound peer that least recently announced a new
        // block, breaking ties towards the newer connection.
        let worst = candidates
            .into_iter()
            .filter(|id| {
                self.nodes
                    .get(*id)
                    .map_or(false, |s| !s.chain_sync.protect)
            })
            .min_by_key(|id| {
                let last = self
                    .nodes
                    .get(*id)
                    .and_then(|s| s.last_block_announcement)
                    .unwrap_or_default();
                (last, std::cmp::Reverse(*id))
            });

        if let Some(worst) = worst {
            let (connected_since, in_flight) = match self.nodes.get(worst) {
                Some(s) => (s.connected_since, s.in_flight_count()),
                None => return,
            };
            // Give the peer long enough for new information to arrive,
            // and never interrupt a block download.
            if now - connected_since > MINIMUM_CONNECT_TIME && in_flight == 0 {
                debug!("disconnecting extra outbound peer={}", worst);
                self.disconnect(worst, DisconnectReason::ExtraOutboundPeer);
                // An eviction means we connected past our target since
                // the last stale tip; stop asking for extras.
                self.outbox.push(Io::TryNewOutbound(false));
                self.requested_extra_outbound = false;
            } else {
                debug!(
                    "keeping outbound peer={} chosen for eviction (connect time {}, in flight {})",
                    worst, connected_since, in_flight
                );
            }
        }
    }

    ///////////////////////////////////////////////////////////////////
    // Chain notifications
    ///////////////////////////////////////////////////////////////////

    /// A block was connected to the active chain.
    pub fn block_connected(&mut self, block: &Block) {
        self.mempool.remove_orphans_for_block(block);
        self.invmgr.confirmed(block.txdata.iter().map(|tx| tx.txid()));
        self.nodes.tip_updated(self.clock.local_time());
    }

    /// The active tip changed. Queues announcements of the new blocks to
    /// every peer that plausibly cares.
    pub fn updated_block_tip(&mut self, new_tip: BlockId, fork: Option<BlockId>, ibd: bool) {
        if ibd {
            return;
        }
        // Hashes of the blocks that weren't previously on the best
        // chain, newest first. A huge reorganization is announced only
        // partially; peers resync the rest.
        let mut hashes = Vec::new();
        let mut walk = Some(new_tip);

        while let Some(entry) = walk {
            if Some(entry) == fork {
                break;
            }
            hashes.push(self.chain.hash(entry));
            if hashes.len() == MAX_BLOCKS_TO_ANNOUNCE {
                break;
            }
            walk = self.chain.prev(entry);
        }
        let new_height = self.chain.height(new_tip) as i32;

        for id in self.nodes.ids() {
            let starting_height = self.nodes.get(id).map_or(-1, |s| s.starting_height);
            let floor = if starting_height != -1 {
                starting_height - 2000
            } else {
                0
            };
            if new_height > floor {
                for hash in hashes.iter().rev() {
                    self.invmgr.queue_block_announcement(id, *hash);
                }
            }
        }
    }

    /// Validation finished for a block we routed to the chain engine.
    pub fn block_checked(&mut self, hash: BlockHash, verdict: &BlockVerdict) {
        let source = self.nodes.block_source(&hash);

        if !verdict.valid {
            if let Some((peer, punish)) = source {
                // Internal reject codes never leave the node.
                if verdict.code > 0 && !verdict.internal && self.nodes.contains(peer) {
                    let mut reason = verdict.reason.clone();
                    reason.truncate(MAX_REJECT_MESSAGE_LENGTH);

                    if let Some(state) = self.nodes.get_mut(peer) {
                        state.rejects.push(BlockReject {
                            code: verdict.code,
                            reason,
                            hash,
                        });
                    }
                    if verdict.dos > 0 && punish {
                        self.misbehave(peer, verdict.dos);
                    }
                }
            }
        } else if !self.chain.is_initial_block_download() {
            // The block is valid and, as far as we can tell before the
            // tip update lands, the best we know of: nothing else is in
            // flight. Reward the source by asking it to announce in
            // compact form.
            let in_flight_here = self.nodes.in_flight_with(&hash).is_some() as usize;

            if in_flight_here == self.nodes.in_flight_total() {
                if let Some((peer, _)) = source {
                    self.maybe_set_cmpct_announcer(peer);
                }
            }
        }
        self.nodes.clear_block_source(&hash);
    }

    fn maybe_set_cmpct_announcer(&mut self, id: PeerId) {
        use nodestate::CmpctRotation;

        let version = if self.config.services.has(ServiceFlags::WITNESS) {
            2
        } else {
            1
        };
        match self.nodes.rotate_cmpct_announcer(id) {
            Some(CmpctRotation::Announce { stop }) => {
                if let Some(stop) = stop {
                    // Only a few peers announce compactly at a time.
                    self.outbox.message(
                        stop,
                        NetworkMessage::SendCmpct(SendCmpct {
                            send_compact: false,
                            version,
                        }),
                    );
                }
                self.outbox.message(
                    id,
                    NetworkMessage::SendCmpct(SendCmpct {
                        send_compact: true,
                        version,
                    }),
                );
            }
            Some(CmpctRotation::Refreshed) | None => {}
        }
    }

    /// Push a freshly validated block to peers that asked for compact
    /// announcements, ahead of the regular announcement flow.
    pub fn relay_compact_block(
        &mut self,
        entry: BlockId,
        compact: &HeaderAndShortIds,
        witness_enabled: bool,
    ) {
        let hash = self.chain.hash(entry);
        let prev = self.chain.prev(entry);

        for id in self.nodes.ids() {
            self.nodes.process_block_availability(id, &self.chain);

            let eligible = {
                let state = match self.nodes.get(id) {
                    Some(state) => state,
                    None => continue,
                };
                // Peers this old might ban us for an unvalidated block.
                state.version >= INVALID_CB_NO_BAN_VERSION
                    && !state.disconnecting
                    && state.prefer_header_and_ids
                    && (!witness_enabled || state.wants_cmpct_witness)
                    && !self.nodes.peer_has_header(state, entry, &self.chain)
                    && prev.map_or(false, |p| {
                        self.nodes.peer_has_header(state, p, &self.chain)
                    })
            };
            if eligible {
                info!("sending header-and-ids {} to peer={}", hash, id);
                self.outbox.message(
                    id,
                    NetworkMessage::CmpctBlock(
                        bitcoin::network::message_compact_blocks::CmpctBlock {
                            compact_block: compact.clone(),
                        },
                    ),
                );
                if let Some(state) = self.nodes.get_mut(id) {
                    state.best_header_sent = Some(entry);
                }
            }
        }
    }
}
