//! End-to-end tests of the state machine, driven through its public
//! inputs against the model chain.
mod util;

use std::collections::HashSet;

use bitcoin::hashes::Hash as _;
use bitcoin::network::address::Address;
use bitcoin::network::constants::ServiceFlags;
use bitcoin::network::message::{NetworkMessage, RawNetworkMessage};
use bitcoin::network::message_blockdata::Inventory;
use bitcoin::network::message_compact_blocks::{BlockTxn, CmpctBlock, SendCmpct};
use bitcoin::network::message_network::VersionMessage;
use bitcoin::util::bip152::BlockTransactions;

use galena_common::block::time::LocalDuration;
use galena_common::network::Network;
use galena_common::p2p::{ConnectInfo, Interrupt, Link, PeerId};

use super::*;
use util::*;

type Machine = StateMachine<TestChain, TestMempool, TestAddrs>;

const NETWORK: Network = Network::Regtest;

fn config() -> Config {
    Config {
        network: NETWORK,
        ..Config::default()
    }
}

fn machine_with(chain: TestChain, cfg: Config) -> Machine {
    let mut machine = StateMachine::new(
        chain,
        TestMempool::default(),
        TestAddrs::default(),
        fastrand::Rng::with_seed(42),
        cfg,
    );
    machine.initialize(genesis_time(NETWORK));
    machine
}

fn machine() -> Machine {
    machine_with(TestChain::new(NETWORK), config())
}

fn conn(id: PeerId, link: Link) -> ConnectInfo {
    ConnectInfo {
        id,
        addr: ([88, 88, 88, id as u8], 8333).into(),
        local_addr: ([127, 0, 0, 1], 8333).into(),
        name: format!("peer-{}", id),
        link,
        whitelisted: false,
        manual: false,
        one_shot: false,
        feeler: false,
    }
}

fn raw(payload: NetworkMessage) -> RawNetworkMessage {
    RawNetworkMessage {
        magic: NETWORK.magic(),
        payload,
    }
}

fn remote_version(id: PeerId, height: i32) -> VersionMessage {
    let addr: std::net::SocketAddr = ([88, 88, 88, id as u8], 8333).into();

    VersionMessage {
        version: PROTOCOL_VERSION,
        services: ServiceFlags::NETWORK | ServiceFlags::WITNESS,
        timestamp: genesis_time(NETWORK).as_secs() as i64,
        receiver: Address::new(&([127, 0, 0, 1], 8333).into(), ServiceFlags::NONE),
        sender: Address::new(&addr, ServiceFlags::NETWORK),
        nonce: 0xbeef_0000 + id,
        user_agent: "/test:1.0/".to_owned(),
        start_height: height,
        relay: true,
    }
}

fn receive(machine: &mut Machine, id: PeerId, payload: NetworkMessage) {
    machine.message_received(id, raw(payload), &Interrupt::new());
}

fn handshake(machine: &mut Machine, id: PeerId, link: Link, height: i32) {
    machine.peer_connected(conn(id, link));
    receive(machine, id, NetworkMessage::Version(remote_version(id, height)));
    receive(machine, id, NetworkMessage::Verack);
    machine.drain().for_each(drop);
}

fn messages(machine: &mut Machine) -> Vec<(PeerId, NetworkMessage)> {
    machine
        .drain()
        .filter_map(|io| match io {
            Io::Message(id, msg) => Some((id, msg)),
            _ => None,
        })
        .collect()
}

fn outputs(machine: &mut Machine) -> Vec<Io> {
    machine.drain().collect()
}

fn misbehavior(machine: &Machine, id: PeerId) -> u32 {
    machine.node_state_stats(id).unwrap().misbehavior
}

#[test]
fn test_handshake_round_trip() {
    let mut machine = machine();

    machine.peer_connected(conn(1, Link::Outbound));
    let sent = messages(&mut machine);
    assert!(
        matches!(sent.first(), Some((1, NetworkMessage::Version(_)))),
        "outbound connections get the version push"
    );

    receive(&mut machine, 1, NetworkMessage::Version(remote_version(1, 0)));
    let sent = messages(&mut machine);
    assert!(sent.iter().any(|(_, m)| matches!(m, NetworkMessage::Verack)));
    assert!(
        sent.iter().any(|(_, m)| matches!(m, NetworkMessage::GetAddr)),
        "outbound peers are asked for addresses"
    );

    receive(&mut machine, 1, NetworkMessage::Verack);
    let sent = messages(&mut machine)
        .into_iter()
        .map(|(_, m)| m)
        .collect::<Vec<_>>();

    assert!(matches!(sent[0], NetworkMessage::SendHeaders));
    assert!(matches!(
        sent[1],
        NetworkMessage::SendCmpct(SendCmpct {
            send_compact: false,
            version: 2
        })
    ));
    assert!(matches!(
        sent[2],
        NetworkMessage::SendCmpct(SendCmpct {
            send_compact: false,
            version: 1
        })
    ));

    // The handshake is complete: the send tick is live and pings.
    machine.send_messages(1);
    assert!(messages(&mut machine)
        .iter()
        .any(|(_, m)| matches!(m, NetworkMessage::Ping(_))));
}

#[test]
fn test_message_before_version_scores() {
    let mut machine = machine();

    machine.peer_connected(conn(1, Link::Inbound));
    machine.drain().for_each(drop);

    receive(&mut machine, 1, NetworkMessage::GetAddr);
    assert_eq!(misbehavior(&machine, 1), 1);

    receive(&mut machine, 1, NetworkMessage::Version(remote_version(1, 0)));
    receive(&mut machine, 1, NetworkMessage::MemPool);
    assert_eq!(misbehavior(&machine, 1), 2, "non-handshake before verack");
}

#[test]
fn test_duplicate_version_rejected() {
    let mut machine = machine();

    handshake(&mut machine, 1, Link::Outbound, 0);
    receive(&mut machine, 1, NetworkMessage::Version(remote_version(1, 0)));

    assert_eq!(misbehavior(&machine, 1), 1);
    assert!(messages(&mut machine).iter().any(|(_, m)| matches!(
        m,
        NetworkMessage::Reject(r) if r.message == "version"
    )));
}

#[test]
fn test_initial_sync_and_block_download() {
    let rng = fastrand::Rng::with_seed(7);
    let genesis = NETWORK.genesis();
    let blocks = gen_chain(&genesis, 40, &rng);
    let headers = blocks.iter().map(|b| b.header).collect::<Vec<_>>();

    let mut machine = machine();
    handshake(&mut machine, 1, Link::Outbound, 40);

    // The send tick starts headers sync.
    machine.send_messages(1);
    let sent = messages(&mut machine);
    assert!(
        sent.iter()
            .any(|(_, m)| matches!(m, NetworkMessage::GetHeaders(_))),
        "initial getheaders"
    );

    // A short batch: the peer has nothing more; blocks get scheduled.
    receive(&mut machine, 1, NetworkMessage::Headers(headers));
    machine.drain().for_each(drop);

    machine.send_messages(1);
    let getdata = messages(&mut machine)
        .into_iter()
        .find_map(|(_, m)| match m {
            NetworkMessage::GetData(invs) => Some(invs),
            _ => None,
        })
        .expect("blocks are requested");

    assert_eq!(getdata.len(), MAX_BLOCKS_IN_TRANSIT_PER_PEER);
    assert!(
        matches!(getdata[0], Inventory::WitnessBlock(h) if h == blocks[0].block_hash()),
        "download begins at the first missing block"
    );

    // Delivering the first block frees a slot; the window slides.
    receive(&mut machine, 1, NetworkMessage::Block(blocks[0].clone()));
    assert_eq!(StateMachine::chain(&machine).tip_height(), 1);

    machine.send_messages(1);
    let refill = messages(&mut machine)
        .into_iter()
        .find_map(|(_, m)| match m {
            NetworkMessage::GetData(invs) => Some(invs),
            _ => None,
        })
        .expect("the freed slot is refilled");

    assert_eq!(refill.len(), 1);
    assert!(matches!(refill[0], Inventory::WitnessBlock(h) if h == blocks[16].block_hash()));
}

#[test]
fn test_max_headers_batch_requests_more() {
    let rng = fastrand::Rng::with_seed(7);
    let genesis = NETWORK.genesis();
    let blocks = gen_chain(&genesis, MAX_HEADERS_RESULTS, &rng);
    let headers = blocks.iter().map(|b| b.header).collect::<Vec<_>>();

    let mut machine = machine();
    handshake(&mut machine, 1, Link::Outbound, headers.len() as i32);

    receive(&mut machine, 1, NetworkMessage::Headers(headers));

    let follow_up = messages(&mut machine)
        .into_iter()
        .find_map(|(_, m)| match m {
            NetworkMessage::GetHeaders(g) => Some(g),
            _ => None,
        })
        .expect("a maximum-size batch triggers a follow-up getheaders");

    assert_eq!(
        follow_up.locator_hashes,
        vec![blocks.last().unwrap().block_hash()],
        "the follow-up continues from the last received header"
    );
}

#[test]
fn test_non_continuous_headers_score() {
    let rng = fastrand::Rng::with_seed(7);
    let genesis = NETWORK.genesis();
    let blocks = gen_chain(&genesis, 3, &rng);

    let mut machine = machine();
    handshake(&mut machine, 1, Link::Outbound, 3);

    // Skip the middle header: the sequence breaks.
    let broken = vec![blocks[0].header, blocks[2].header];
    receive(&mut machine, 1, NetworkMessage::Headers(broken));

    assert_eq!(misbehavior(&machine, 1), 20);
    assert!(
        StateMachine::chain(&machine).lookup(&blocks[2].block_hash()).is_none(),
        "the batch is rejected"
    );
}

#[test]
fn test_unconnecting_headers_streak() {
    let rng = fastrand::Rng::with_seed(7);
    // A foreign chain whose parent we will never have.
    let foreign = gen_chain(&gen_block(&NETWORK.genesis(), &rng).header, 2, &rng);
    let announcement = foreign.iter().map(|b| b.header).collect::<Vec<_>>();

    let mut machine = machine();
    handshake(&mut machine, 1, Link::Outbound, 100);

    for round in 1..=MAX_UNCONNECTING_HEADERS {
        receive(&mut machine, 1, NetworkMessage::Headers(announcement.clone()));

        let sent = messages(&mut machine);
        assert!(
            sent.iter()
                .any(|(_, m)| matches!(m, NetworkMessage::GetHeaders(_))),
            "every unconnecting announcement is answered with getheaders"
        );
        let expected = if round < MAX_UNCONNECTING_HEADERS { 0 } else { 20 };
        assert_eq!(misbehavior(&machine, 1), expected);
    }
}

#[test]
fn test_inv_flood_leads_to_ban() {
    let rng = fastrand::Rng::with_seed(7);
    let mut machine = machine();
    handshake(&mut machine, 1, Link::Outbound, 0);

    let flood = (0..60_000)
        .map(|_| Inventory::Transaction(gen_transaction(&rng).txid()))
        .collect::<Vec<_>>();

    for round in 1..=5 {
        receive(&mut machine, 1, NetworkMessage::Inv(flood.clone()));
        assert_eq!(misbehavior(&machine, 1), round * 20);
    }

    // The fifth flood crossed the threshold; the flush banned the peer.
    let out = outputs(&mut machine);
    assert!(out
        .iter()
        .any(|io| matches!(io, Io::Disconnect(1, DisconnectReason::Banned))));
    assert!(out.iter().any(|io| matches!(io, Io::Ban(1))));
}

#[test]
fn test_tx_inv_is_requested() {
    let rng = fastrand::Rng::with_seed(7);
    let mut machine = machine();
    handshake(&mut machine, 1, Link::Outbound, 0);

    let txid = gen_transaction(&rng).txid();
    receive(&mut machine, 1, NetworkMessage::Inv(vec![Inventory::Transaction(txid)]));

    machine.send_messages(1);
    let getdata = messages(&mut machine)
        .into_iter()
        .find_map(|(_, m)| match m {
            NetworkMessage::GetData(invs) => Some(invs),
            _ => None,
        })
        .expect("the transaction is fetched");

    assert!(matches!(getdata[0], Inventory::WitnessTransaction(t) if t == txid));
}

#[test]
fn test_block_inv_asks_for_headers() {
    let rng = fastrand::Rng::with_seed(7);
    let unknown = gen_block(&NETWORK.genesis(), &rng).block_hash();

    let mut machine = machine();
    handshake(&mut machine, 1, Link::Outbound, 1);

    receive(&mut machine, 1, NetworkMessage::Inv(vec![Inventory::Block(unknown)]));

    let get_headers = messages(&mut machine)
        .into_iter()
        .find_map(|(_, m)| match m {
            NetworkMessage::GetHeaders(g) => Some(g),
            _ => None,
        })
        .expect("an unknown block inv is answered with getheaders");

    assert_eq!(get_headers.stop_hash, unknown);
}

#[test]
fn test_compact_block_reconstructed_from_mempool() {
    let rng = fastrand::Rng::with_seed(7);
    let genesis = NETWORK.genesis();
    let block = gen_block_with(
        &genesis,
        vec![gen_transaction(&rng), gen_transaction(&rng)],
        &rng,
    );

    let mut machine = machine();
    handshake(&mut machine, 1, Link::Outbound, 1);
    receive(
        &mut machine,
        1,
        NetworkMessage::SendCmpct(SendCmpct {
            send_compact: true,
            version: 2,
        }),
    );
    // Everything the block carries is already pooled.
    for tx in &block.txdata {
        machine.mempool_mut().txs.insert(tx.txid(), tx.clone());
    }
    machine.drain().for_each(drop);

    let compact = cmpct::compact_from_block(&block, true, 0x5151).unwrap();
    receive(
        &mut machine,
        1,
        NetworkMessage::CmpctBlock(CmpctBlock {
            compact_block: compact,
        }),
    );

    assert_eq!(
        StateMachine::chain(&machine).accepted_blocks,
        vec![(block.block_hash(), true)],
        "the block is reconstructed without a round trip and force-processed"
    );
    assert!(
        !messages(&mut machine)
            .iter()
            .any(|(_, m)| matches!(m, NetworkMessage::GetBlockTxn(_))),
        "nothing was missing"
    );
}

#[test]
fn test_compact_block_round_trip_for_missing_txs() {
    let rng = fastrand::Rng::with_seed(7);
    let genesis = NETWORK.genesis();
    let block = gen_block_with(
        &genesis,
        vec![gen_transaction(&rng), gen_transaction(&rng)],
        &rng,
    );

    let mut machine = machine();
    handshake(&mut machine, 1, Link::Outbound, 1);
    receive(
        &mut machine,
        1,
        NetworkMessage::SendCmpct(SendCmpct {
            send_compact: true,
            version: 2,
        }),
    );
    machine.drain().for_each(drop);

    let compact = cmpct::compact_from_block(&block, true, 0x5151).unwrap();
    receive(
        &mut machine,
        1,
        NetworkMessage::CmpctBlock(CmpctBlock {
            compact_block: compact,
        }),
    );

    let request = messages(&mut machine)
        .into_iter()
        .find_map(|(_, m)| match m {
            NetworkMessage::GetBlockTxn(g) => Some(g.txs_request),
            _ => None,
        })
        .expect("missing transactions are requested");

    assert_eq!(request.block_hash, block.block_hash());

    let transactions = request
        .indexes
        .iter()
        .map(|i| block.txdata[*i as usize].clone())
        .collect::<Vec<_>>();

    receive(
        &mut machine,
        1,
        NetworkMessage::BlockTxn(BlockTxn {
            transactions: BlockTransactions {
                block_hash: block.block_hash(),
                transactions,
            },
        }),
    );

    assert_eq!(
        StateMachine::chain(&machine).accepted_blocks,
        vec![(block.block_hash(), true)],
        "the filled block is force-processed"
    );
}

#[test]
fn test_stalling_peer_is_disconnected_and_reassigned() {
    let rng = fastrand::Rng::with_seed(7);
    let genesis = NETWORK.genesis();
    let blocks = gen_chain(&genesis, 1100, &rng);
    let headers = blocks.iter().map(|b| b.header).collect::<Vec<_>>();

    let mut machine = machine();
    let mut now = genesis_time(NETWORK);

    handshake(&mut machine, 1, Link::Outbound, 1100);
    handshake(&mut machine, 2, Link::Outbound, 1100);

    // Both peers prove the same chain.
    receive(&mut machine, 1, NetworkMessage::Headers(headers.clone()));
    receive(
        &mut machine,
        2,
        NetworkMessage::Headers(vec![*headers.last().unwrap()]),
    );
    // Everything inside the download window is already on disk, except
    // the sixteen blocks peer 1 is about to hold hostage.
    for block in &blocks[16..1024] {
        machine.chain_mut().set_have_data(&block.block_hash());
    }
    machine.drain().for_each(drop);

    machine.send_messages(1);
    let first = messages(&mut machine);
    assert!(
        first
            .iter()
            .any(|(_, m)| matches!(m, NetworkMessage::GetData(invs) if invs.len() == 16)),
        "peer 1 is assigned the window head"
    );

    // Peer 2 can't fetch anything: the window is pinned on peer 1.
    machine.send_messages(2);
    assert!(
        !messages(&mut machine)
            .iter()
            .any(|(_, m)| matches!(m, NetworkMessage::GetData(_))),
        "nothing left inside the window for peer 2"
    );

    // The stall timeout elapses; the blocking peer is dropped.
    now.elapse(BLOCK_STALLING_TIMEOUT + LocalDuration::from_secs(1));
    machine.tick(now);
    machine.send_messages(1);

    assert!(outputs(&mut machine).iter().any(|io| matches!(
        io,
        Io::Disconnect(1, DisconnectReason::StallingBlockDownload)
    )));
    machine.peer_disconnected(1);

    // The orphaned requests move to peer 2.
    machine.send_messages(2);
    let reassigned = messages(&mut machine)
        .into_iter()
        .find_map(|(_, m)| match m {
            NetworkMessage::GetData(invs) => Some(invs),
            _ => None,
        })
        .expect("the window head is re-requested");

    assert_eq!(reassigned.len(), 16);
    assert!(matches!(reassigned[0], Inventory::WitnessBlock(h) if h == blocks[0].block_hash()));
}

#[test]
fn test_chain_sync_timeout_probe_then_disconnect() {
    let mut machine = machine();
    let mut now = genesis_time(NETWORK);

    handshake(&mut machine, 1, Link::Outbound, 0);

    // First tick: sync starts, and the work deadline is armed.
    machine.send_messages(1);
    machine.drain().for_each(drop);

    // The deadline passes without the peer showing tip-level work: one
    // probing getheaders goes out.
    now.elapse(CHAIN_SYNC_TIMEOUT + LocalDuration::from_secs(1));
    machine.tick(now);
    machine.send_messages(1);

    assert!(
        messages(&mut machine)
            .iter()
            .any(|(_, m)| matches!(m, NetworkMessage::GetHeaders(_))),
        "the peer gets one chance to prove its chain"
    );

    // The grace period passes too: the peer is disconnected.
    now.elapse(HEADERS_RESPONSE_TIME + LocalDuration::from_secs(1));
    machine.tick(now);
    machine.send_messages(1);

    assert!(outputs(&mut machine).iter().any(|io| matches!(
        io,
        Io::Disconnect(1, DisconnectReason::ChainSyncTimeout)
    )));
}

#[test]
fn test_extra_outbound_peer_eviction_prefers_newer() {
    let mut cfg = config();
    cfg.limits.target_outbound_peers = 1;

    let mut machine = machine_with(TestChain::new(NETWORK), cfg);
    let mut now = genesis_time(NETWORK);

    handshake(&mut machine, 1, Link::Outbound, 0);
    handshake(&mut machine, 2, Link::Outbound, 0);
    machine.drain().for_each(drop);

    // Too soon: both peers are younger than the minimum connect time.
    machine.check_for_stale_tip_and_evict_peers();
    assert!(!outputs(&mut machine)
        .iter()
        .any(|io| matches!(io, Io::Disconnect(_, _))));

    now.elapse(MINIMUM_CONNECT_TIME + LocalDuration::from_secs(1));
    machine.tick(now);
    machine.check_for_stale_tip_and_evict_peers();

    // Neither announced a block; the tie goes against the newer peer.
    assert!(outputs(&mut machine).iter().any(|io| matches!(
        io,
        Io::Disconnect(2, DisconnectReason::ExtraOutboundPeer)
    )));
}

#[test]
fn test_stale_tip_requests_extra_outbound() {
    let mut machine = machine();
    let mut now = genesis_time(NETWORK);

    handshake(&mut machine, 1, Link::Outbound, 0);
    machine.drain().for_each(drop);

    // The first check only seeds the last-update clock.
    now.elapse(STALE_CHECK_INTERVAL + LocalDuration::from_secs(1));
    machine.tick(now);
    machine.check_for_stale_tip_and_evict_peers();
    assert!(!outputs(&mut machine)
        .iter()
        .any(|io| matches!(io, Io::TryNewOutbound(true))));

    // Three target spacings later with no tip movement, an extra
    // outbound connection is requested.
    now.elapse(LocalDuration::from_secs(NETWORK.target_spacing() * 3 + 1).max(STALE_CHECK_INTERVAL));
    machine.tick(now);
    machine.check_for_stale_tip_and_evict_peers();

    assert!(outputs(&mut machine)
        .iter()
        .any(|io| matches!(io, Io::TryNewOutbound(true))));
}

#[test]
fn test_getheaders_served_and_best_header_sent() {
    let rng = fastrand::Rng::with_seed(7);
    let genesis = NETWORK.genesis();
    let blocks = gen_chain(&genesis, 5, &rng);

    let mut chain = TestChain::new(NETWORK);
    chain.import_blocks(&blocks);

    let mut machine = machine_with(chain, config());
    handshake(&mut machine, 1, Link::Inbound, 0);

    receive(
        &mut machine,
        1,
        NetworkMessage::GetHeaders(bitcoin::network::message_blockdata::GetHeadersMessage {
            version: PROTOCOL_VERSION,
            locator_hashes: vec![genesis.block_hash()],
            stop_hash: bitcoin::BlockHash::all_zeros(),
        }),
    );

    let served = messages(&mut machine)
        .into_iter()
        .find_map(|(_, m)| match m {
            NetworkMessage::Headers(headers) => Some(headers),
            _ => None,
        })
        .expect("headers are served");

    assert_eq!(served.len(), 5);
    assert_eq!(served[0].block_hash(), blocks[0].block_hash());
}

#[test]
fn test_fee_filter_broadcast() {
    let mut machine = machine();

    handshake(&mut machine, 1, Link::Outbound, 0);
    machine.mempool_mut().min_fee = 5000;

    machine.send_messages(1);
    let rate = messages(&mut machine)
        .into_iter()
        .find_map(|(_, m)| match m {
            NetworkMessage::FeeFilter(rate) => Some(rate),
            _ => None,
        })
        .expect("a fee filter goes out");

    assert!(rate >= 1000, "never below the relay floor");
    assert!(rate < 10_000, "in the neighborhood of the real floor");
}

#[test]
fn test_checkpoint_messages_are_routed() {
    let mut machine = machine();
    handshake(&mut machine, 1, Link::Outbound, 0);

    receive(
        &mut machine,
        1,
        NetworkMessage::Unknown {
            command: bitcoin::network::message::CommandString::try_from_static("checkpoint")
                .unwrap(),
            payload: vec![1, 2, 3],
        },
    );
    assert_eq!(StateMachine::chain(&machine).checkpoints, vec![vec![1, 2, 3]]);

    receive(
        &mut machine,
        1,
        NetworkMessage::Unknown {
            command: bitcoin::network::message::CommandString::try_from_static("get_checkpoint")
                .unwrap(),
            payload: bitcoin::consensus::encode::serialize(&0i32),
        },
    );
    assert!(
        messages(&mut machine).iter().any(|(_, m)| matches!(
            m,
            NetworkMessage::Unknown { command, .. } if command.to_string() == "checkpoint"
        )),
        "checkpoints are served back"
    );
}

#[test]
fn test_addr_relay_is_deterministic() {
    fn relay_targets(source: PeerId) -> HashSet<PeerId> {
        let mut machine = machine();
        let mut now = genesis_time(NETWORK);

        // Inbound sources: outbound peers have an outstanding getaddr,
        // which suppresses relay of their first batch.
        for id in 1..=6 {
            handshake(&mut machine, id, Link::Inbound, 0);
        }
        let addr: std::net::SocketAddr = ([45, 32, 1, 1], 8333).into();
        let entry = (
            now.block_time(),
            Address::new(&addr, ServiceFlags::NETWORK),
        );
        receive(&mut machine, source, NetworkMessage::Addr(vec![entry]));

        // Flush queues at the Poisson cadence.
        let mut targets = HashSet::new();
        for _ in 0..20 {
            now.elapse(AVG_ADDRESS_BROADCAST_INTERVAL * 2);
            machine.tick(now);
            for id in 1..=6 {
                machine.send_messages(id);
            }
            for (id, msg) in messages(&mut machine) {
                if let NetworkMessage::Addr(addrs) = msg {
                    if addrs
                        .iter()
                        .any(|(_, a)| a.socket_addr().map_or(false, |s| s == addr))
                    {
                        targets.insert(id);
                    }
                }
            }
        }
        // The source knows the address already and never gets it back.
        targets.remove(&source);
        targets
    }

    let from_one = relay_targets(1);
    let from_two = relay_targets(2);

    assert!(!from_one.is_empty(), "the address is relayed");
    assert!(from_one.len() <= 2, "at most two relay targets");

    let mut lhs = from_one.clone();
    let mut rhs = from_two.clone();
    lhs.remove(&2);
    rhs.remove(&1);

    assert_eq!(
        lhs, rhs,
        "the same address picks the same relay targets, whoever sent it"
    );
}

#[test]
fn test_mempool_request_without_bloom_disconnects() {
    let mut cfg = config();
    cfg.services = ServiceFlags::NETWORK; // no bloom

    let mut machine = machine_with(TestChain::new(NETWORK), cfg);
    handshake(&mut machine, 1, Link::Inbound, 0);

    receive(&mut machine, 1, NetworkMessage::MemPool);

    assert!(outputs(&mut machine).iter().any(|io| matches!(
        io,
        Io::Disconnect(1, DisconnectReason::MempoolRequestDenied)
    )));
}

#[test]
fn test_submitted_transaction_is_announced() {
    let rng = fastrand::Rng::with_seed(7);
    let mut machine = machine();

    handshake(&mut machine, 1, Link::Outbound, 0);
    machine.drain().for_each(drop);

    let tx = gen_transaction(&rng);
    let txid = tx.txid();
    let (reply, replies) = crossbeam_channel::unbounded();

    machine.command(Command::SubmitTransaction(tx, reply));
    assert_eq!(replies.recv().unwrap(), vec![1]);

    machine.send_messages(1);
    let invs = messages(&mut machine)
        .into_iter()
        .find_map(|(_, m)| match m {
            NetworkMessage::Inv(invs) => Some(invs),
            _ => None,
        })
        .expect("the transaction is announced");

    assert!(invs.contains(&Inventory::Transaction(txid)));
}
