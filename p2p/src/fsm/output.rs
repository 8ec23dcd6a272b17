//! Protocol outputs.
//!
//! The state machine communicates with the connection manager through an
//! ordered queue of [`Io`] instructions. Each sub-protocol holds a clone
//! of the [`Outbox`] and reaches it through a narrow capability trait,
//! so a manager can only emit the message kinds it owns.
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use log::*;

use bitcoin::network::address::Address;
use bitcoin::network::message::NetworkMessage;
use bitcoin::network::message_blockdata::{GetHeadersMessage, Inventory};
use bitcoin::network::message_compact_blocks::{BlockTxn, CmpctBlock};
use bitcoin::util::bip152::{BlockTransactions, HeaderAndShortIds};
use bitcoin::util::merkleblock::MerkleBlock;
use bitcoin::{Block, BlockHeader, Transaction};

use galena_common::block::time::LocalDuration;
use galena_common::block::BlockTime;
use galena_common::p2p::PeerId;

use super::event::Event;
use super::{addrmgr, syncmgr, DisconnectReason, Locators};

/// An instruction for the connection manager.
#[derive(Debug)]
pub enum Io {
    /// Send a message to a peer.
    Message(PeerId, NetworkMessage),
    /// An event has occurred.
    Event(Event),
    /// Disconnect from a peer.
    Disconnect(PeerId, DisconnectReason),
    /// Ban a peer's address.
    Ban(PeerId),
    /// Ask to be woken up after the given duration.
    Wakeup(LocalDuration),
    /// Ask the connection manager to open (or stop opening) one
    /// outbound connection beyond its target.
    TryNewOutbound(bool),
}

/// Holds protocol outputs destined for the connection manager.
#[derive(Debug, Clone)]
pub struct Outbox {
    /// Protocol version, used when building version-dependent payloads.
    version: u32,
    /// Output queue.
    outbound: Rc<RefCell<VecDeque<Io>>>,
}

impl Iterator for Outbox {
    type Item = Io;

    fn next(&mut self) -> Option<Io> {
        self.outbound.borrow_mut().pop_front()
    }
}

impl Outbox {
    /// Create a new outbox.
    pub fn new(version: u32) -> Self {
        Self {
            version,
            outbound: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    /// Push an output to the queue.
    pub fn push(&self, output: Io) {
        self.outbound.borrow_mut().push_back(output);
    }

    /// Push a message to the queue.
    pub fn message(&self, addr: PeerId, message: NetworkMessage) -> &Self {
        debug!("peer={}: Sending {:?}", addr, message.cmd());
        self.push(Io::Message(addr, message));
        self
    }

    /// Push an event to the queue.
    pub fn event(&self, event: Event) {
        self.push(Io::Event(event));
    }

    /// Drain the output queue.
    pub fn drain(&mut self) -> Drain {
        Drain {
            items: self.outbound.clone(),
        }
    }

    /// Build a `getheaders` message from locators.
    pub fn get_headers(&self, addr: PeerId, (locator_hashes, stop_hash): Locators) {
        self.message(
            addr,
            NetworkMessage::GetHeaders(GetHeadersMessage {
                version: self.version,
                // Starting hashes, highest heights first.
                locator_hashes,
                // The zero hash means "as many as possible".
                stop_hash,
            }),
        );
    }
}

/// Draining iterator over the output queue.
pub struct Drain {
    items: Rc<RefCell<VecDeque<Io>>>,
}

impl Iterator for Drain {
    type Item = Io;

    fn next(&mut self) -> Option<Self::Item> {
        self.items.borrow_mut().pop_front()
    }
}

/// Ability to disconnect from peers.
pub trait Disconnect {
    /// Disconnect from a peer.
    fn disconnect(&self, addr: PeerId, reason: DisconnectReason);
}

impl Disconnect for Outbox {
    fn disconnect(&self, addr: PeerId, reason: DisconnectReason) {
        debug!("peer={}: Disconnecting: {}", addr, reason);
        self.push(Io::Disconnect(addr, reason));
    }
}

/// Ability to schedule wake-ups.
pub trait Wakeup {
    /// Ask to be woken up after the given duration.
    fn wakeup(&self, duration: LocalDuration) -> &Self;
}

impl Wakeup for Outbox {
    fn wakeup(&self, duration: LocalDuration) -> &Self {
        self.push(Io::Wakeup(duration));
        self
    }
}

/// The ability to send `ping` and `pong` messages.
pub trait Ping {
    /// Send a `ping` with a nonce.
    fn ping(&self, addr: PeerId, nonce: u64) -> &Self;
    /// Send a nonce-free `ping`, for peers predating BIP 31.
    fn ping_legacy(&self, addr: PeerId);
    /// Send a `pong`.
    fn pong(&self, addr: PeerId, nonce: u64);
}

impl Ping for Outbox {
    fn ping(&self, addr: PeerId, nonce: u64) -> &Self {
        self.message(addr, NetworkMessage::Ping(nonce));
        self
    }

    fn ping_legacy(&self, addr: PeerId) {
        self.message(addr, NetworkMessage::Ping(0));
    }

    fn pong(&self, addr: PeerId, nonce: u64) {
        self.message(addr, NetworkMessage::Pong(nonce));
    }
}

/// The ability to exchange headers and request blocks.
pub trait SyncHeaders {
    /// Send a `getheaders` request.
    fn get_headers(&self, addr: PeerId, locators: Locators);
    /// Send a `headers` batch.
    fn send_headers(&self, addr: PeerId, headers: Vec<BlockHeader>);
    /// Send a `getdata` for blocks.
    fn get_data(&self, addr: PeerId, invs: Vec<Inventory>);
    /// Emit a sync event.
    fn event(&self, event: syncmgr::Event);
}

impl SyncHeaders for Outbox {
    fn get_headers(&self, addr: PeerId, locators: Locators) {
        Outbox::get_headers(self, addr, locators);
    }

    fn send_headers(&self, addr: PeerId, headers: Vec<BlockHeader>) {
        self.message(addr, NetworkMessage::Headers(headers));
    }

    fn get_data(&self, addr: PeerId, invs: Vec<Inventory>) {
        self.message(addr, NetworkMessage::GetData(invs));
    }

    fn event(&self, event: syncmgr::Event) {
        debug!("[sync] {}", &event);
        self.event(Event::Chain(event));
    }
}

/// The ability to send and serve inventories.
pub trait Inventories {
    /// Send an `inv`.
    fn inv(&self, addr: PeerId, invs: Vec<Inventory>);
    /// Send a `getdata`.
    fn get_data(&self, addr: PeerId, invs: Vec<Inventory>);
    /// Send a `headers` announcement.
    fn headers(&self, addr: PeerId, headers: Vec<BlockHeader>);
    /// Send a `cmpctblock` announcement.
    fn cmpct_block(&self, addr: PeerId, block: HeaderAndShortIds);
    /// Serve a full block.
    fn block(&self, addr: PeerId, block: Block);
    /// Serve a filtered block with its matched transactions.
    fn merkle_block(&self, addr: PeerId, block: MerkleBlock, matched: Vec<Transaction>);
    /// Serve a transaction.
    fn tx(&self, addr: PeerId, tx: Transaction);
    /// Serve a `blocktxn` answer.
    fn block_txn(&self, addr: PeerId, txn: BlockTransactions);
    /// Report inventories we could not serve.
    fn not_found(&self, addr: PeerId, invs: Vec<Inventory>);
    /// Send a `feefilter`.
    fn fee_filter(&self, addr: PeerId, rate: i64);
}

impl Inventories for Outbox {
    fn inv(&self, addr: PeerId, invs: Vec<Inventory>) {
        self.message(addr, NetworkMessage::Inv(invs));
    }

    fn get_data(&self, addr: PeerId, invs: Vec<Inventory>) {
        self.message(addr, NetworkMessage::GetData(invs));
    }

    fn headers(&self, addr: PeerId, headers: Vec<BlockHeader>) {
        self.message(addr, NetworkMessage::Headers(headers));
    }

    fn cmpct_block(&self, addr: PeerId, block: HeaderAndShortIds) {
        self.message(
            addr,
            NetworkMessage::CmpctBlock(CmpctBlock {
                compact_block: block,
            }),
        );
    }

    fn block(&self, addr: PeerId, block: Block) {
        self.message(addr, NetworkMessage::Block(block));
    }

    fn merkle_block(&self, addr: PeerId, block: MerkleBlock, matched: Vec<Transaction>) {
        self.message(addr, NetworkMessage::MerkleBlock(block));
        for tx in matched {
            self.message(addr, NetworkMessage::Tx(tx));
        }
    }

    fn tx(&self, addr: PeerId, tx: Transaction) {
        self.message(addr, NetworkMessage::Tx(tx));
    }

    fn block_txn(&self, addr: PeerId, txn: BlockTransactions) {
        self.message(addr, NetworkMessage::BlockTxn(BlockTxn { transactions: txn }));
    }

    fn not_found(&self, addr: PeerId, invs: Vec<Inventory>) {
        self.message(addr, NetworkMessage::NotFound(invs));
    }

    fn fee_filter(&self, addr: PeerId, rate: i64) {
        self.message(addr, NetworkMessage::FeeFilter(rate));
    }
}

/// The ability to exchange peer addresses.
pub trait SendAddrs {
    /// Send an `addr` batch.
    fn addr(&self, addr: PeerId, addrs: Vec<(BlockTime, Address)>);
    /// Send a `getaddr` request.
    fn get_addr(&self, addr: PeerId);
    /// Emit an address event.
    fn event(&self, event: addrmgr::Event);
}

impl SendAddrs for Outbox {
    fn addr(&self, addr: PeerId, addrs: Vec<(BlockTime, Address)>) {
        self.message(addr, NetworkMessage::Addr(addrs));
    }

    fn get_addr(&self, addr: PeerId) {
        self.message(addr, NetworkMessage::GetAddr);
    }

    fn event(&self, event: addrmgr::Event) {
        debug!("[addr] {}", &event);
        self.event(Event::Address(event));
    }
}
