//! Chain networks and their parameters.
use bitcoin::blockdata::constants;
use bitcoin::BlockHeader;

/// The chain network we are operating on.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Network {
    /// The production network.
    Mainnet,
    /// The public test network.
    Testnet,
    /// Local regression testing.
    Regtest,
}

impl Default for Network {
    fn default() -> Self {
        Self::Mainnet
    }
}

impl Network {
    /// The wire protocol magic.
    pub fn magic(&self) -> u32 {
        bitcoin::Network::from(*self).magic()
    }

    /// The default listening port.
    pub fn port(&self) -> u16 {
        match self {
            Network::Mainnet => 8333,
            Network::Testnet => 18333,
            Network::Regtest => 18444,
        }
    }

    /// The consensus-targeted spacing between blocks, in seconds.
    pub fn target_spacing(&self) -> u64 {
        600
    }

    /// The genesis block header.
    pub fn genesis(&self) -> BlockHeader {
        constants::genesis_block((*self).into()).header
    }
}

impl From<Network> for bitcoin::Network {
    fn from(network: Network) -> Self {
        match network {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
            Network::Regtest => bitcoin::Network::Regtest,
        }
    }
}
