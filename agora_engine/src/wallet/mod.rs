//! Wallet backends for the [`Wallet`](crate::traits::Wallet) contract.
//!
//! Only a simulated backend ships with the engine. It is complete enough to run full escrowed orders between nodes
//! on a shared in-memory chain, which is what regtest nodes and the test suites do.
mod chain;
mod multi;
mod simulated;

pub use chain::{
    key_address,
    script_address,
    ChainEvent,
    MinedTransaction,
    RedeemScript,
    SimTransaction,
    SimulatedChain,
    SpentOutput,
    TimeoutPath,
    Witness,
    DUST_LIMIT,
};
pub use multi::MultiWallet;
pub use simulated::SimulatedWallet;
