use agora_engine::{
    helpers::IdentityError,
    traits::{ExchangeRateError, TransportError, WalletError},
    OrderFlowError,
    StoreError,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Could not initialize the node. {0}")]
    InitializeError(String),
    #[error("Invalid node configuration. {0}")]
    ConfigurationError(String),
    #[error("The order store failed. {0}")]
    StoreError(#[from] StoreError),
    #[error("A wallet failed. {0}")]
    WalletError(#[from] WalletError),
    #[error("The node's identity keys are unusable. {0}")]
    IdentityError(#[from] IdentityError),
    #[error("Could not set up exchange rates. {0}")]
    ExchangeRateError(#[from] ExchangeRateError),
    #[error("Could not join the network. {0}")]
    TransportError(#[from] TransportError),
    #[error("Order processing failed. {0}")]
    OrderFlowError(#[from] OrderFlowError),
    #[error("An I/O error happened in the node. {0}")]
    IOError(#[from] std::io::Error),
}
