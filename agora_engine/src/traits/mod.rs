//! # Contracts with the outside world
//!
//! The order processor never talks to a coin wallet, the network or a price feed directly. It goes through these
//! traits, so nodes can plug in real backends while tests use the simulated wallet and in-memory network.
//!
//! * [`Wallet`] is the per-coin wallet contract: addresses, spends, multisig escrow and transaction subscriptions.
//! * [`PeerTransport`] moves envelopes between nodes for the reliable messenger.
//! * [`RateSource`] is an upstream exchange-rate feed for the exchange-rate cache.
mod rate_source;
mod transport;
mod wallet;

pub use rate_source::{ExchangeRateError, RateSource};
pub use transport::{PeerTransport, TransportError};
pub use wallet::{
    Balance,
    EscrowSignature,
    FeeLevel,
    MultisigAddress,
    TxInput,
    TxOutput,
    UnsignedTransaction,
    Wallet,
    WalletBatch,
    WalletError,
};
