//! Wire-message framing.
//!
//! Turns a peer's byte stream into framed messages: 4-byte magic,
//! 12-byte command, 4-byte length, 4-byte double-SHA256 checksum,
//! payload. A bad magic poisons the whole stream; a bad checksum or an
//! undecodable payload only costs the one frame.
use std::io;

use bitcoin::consensus::encode::{self, deserialize};
use bitcoin::network::message::RawNetworkMessage;
use thiserror::Error;

/// Wire header size.
const HEADER_SIZE: usize = 24;
/// Largest payload we will frame (4 MB).
const MAX_MESSAGE_SIZE: usize = 4_000_000;

/// Framing failure.
#[derive(Error, Debug)]
pub enum Error {
    /// The stream does not carry our network magic. Unrecoverable.
    #[error("invalid message start: {0:x}")]
    BadMagic(u32),
    /// The advertised payload size exceeds the protocol maximum.
    /// Unrecoverable, since the frame boundary is lost.
    #[error("oversized message: {command}, {size} bytes")]
    Oversized {
        /// Claimed command.
        command: String,
        /// Claimed payload size.
        size: usize,
    },
    /// The frame's checksum did not match its payload. The frame is
    /// dropped and decoding continues.
    #[error("bad checksum for message: {command}")]
    BadChecksum {
        /// Claimed command.
        command: String,
    },
    /// The payload could not be decoded. The frame is dropped and
    /// decoding continues; the peer is told via `reject`.
    #[error("malformed payload for message: {command}")]
    Malformed {
        /// Claimed command.
        command: String,
    },
}

/// Message stream decoder.
#[derive(Debug)]
pub struct Decoder {
    unparsed: Vec<u8>,
    magic: u32,
}

impl Decoder {
    /// Create a new stream decoder for the given network magic.
    pub fn new(magic: u32, capacity: usize) -> Self {
        Self {
            unparsed: Vec::with_capacity(capacity),
            magic,
        }
    }

    /// Input bytes into the decoder.
    pub fn input(&mut self, bytes: &[u8]) {
        self.unparsed.extend_from_slice(bytes);
    }

    /// Decode and return the next message. Returns `Ok(None)` when more
    /// bytes are needed.
    pub fn decode_next(&mut self) -> Result<Option<RawNetworkMessage>, Error> {
        if self.unparsed.len() < HEADER_SIZE {
            return Ok(None);
        }
        let header = &self.unparsed[..HEADER_SIZE];
        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);

        if magic != self.magic {
            return Err(Error::BadMagic(magic));
        }
        let command = command_string(&header[4..16]);
        let size = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;

        if size > MAX_MESSAGE_SIZE {
            return Err(Error::Oversized { command, size });
        }
        if self.unparsed.len() < HEADER_SIZE + size {
            return Ok(None);
        }

        let result = deserialize::<RawNetworkMessage>(&self.unparsed[..HEADER_SIZE + size]);
        self.unparsed.drain(..HEADER_SIZE + size);

        match result {
            Ok(msg) => Ok(Some(msg)),
            Err(encode::Error::InvalidChecksum { .. }) => Err(Error::BadChecksum { command }),
            Err(encode::Error::Io(ref err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                Err(Error::Malformed { command })
            }
            Err(_) => Err(Error::Malformed { command }),
        }
    }
}

fn command_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take_while(|b| **b != 0)
        .map(|b| {
            if b.is_ascii_graphic() {
                *b as char
            } else {
                '?'
            }
        })
        .collect()
}
