//! Peer-logic core of the `galena` node.
//!
//! This crate drives the wire-level peer-to-peer protocol: headers-first
//! block synchronization, per-peer chain knowledge, misbehavior policing,
//! and the scheduling of block, transaction and address announcements.
//!
//! It is written as a deterministic state machine. The embedding node
//! feeds it connection events, decoded messages and timer wake-ups, and
//! drains an ordered queue of I/O instructions in return; sockets, disk
//! and validation threads all live outside.
#![allow(clippy::too_many_arguments, clippy::collapsible_if)]
#![deny(unsafe_code)]

pub mod fsm;
pub mod stream;

pub use fsm::{Command, Config, DisconnectReason, Limits, StateMachine, Whitelist};
