use agora_common::{Amount, CurrencyError};
use thiserror::Error;

use crate::{
    db::StoreError,
    db_types::{MessageKind, OrderId, PeerId},
    escrow::EscrowError,
    helpers::IdentityError,
    messenger::MessengerError,
    order_messages::OrderMessageError,
    ratings::RatingError,
    traits::{ExchangeRateError, TransportError, WalletError},
};

#[derive(Debug, Error)]
pub enum OrderFlowError {
    #[error("Order {0} does not exist")]
    NotFound(OrderId),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("{0} has already been processed")]
    DuplicateMessage(MessageKind),
    #[error("A different {0} has already been stored for this order")]
    ChangedMessage(MessageKind),
    #[error("{kind} is not allowed: {reason}")]
    UnexpectedMessage { kind: MessageKind, reason: String },
    #[error("{kind} cannot be applied before {missing}")]
    MessageDoesNotExist { kind: MessageKind, missing: String },
    #[error("Transaction {0} has already been recorded")]
    DuplicateTransaction(String),
    #[error("Insufficient funds. Needed {needed}, but only {available} is available")]
    InsufficientFunds { needed: Amount, available: Amount },
    #[error("The amount {0} is below the dust threshold")]
    DustAmount(Amount),
    #[error("Peer {0} is unreachable")]
    PeerUnreachable(PeerId),
    #[error("Currency definition is undefined: {0}")]
    CurrencyDefinitionUndefined(String),
    #[error("Value has more precision than the currency allows: {0}")]
    CurrencyValueInsufficientPrecision(String),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Wallet error: {0}")]
    Wallet(WalletError),
    #[error("Rating error: {0}")]
    Rating(#[from] RatingError),
    #[error("Escrow error: {0}")]
    Escrow(EscrowError),
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),
    #[error("Exchange rate error: {0}")]
    ExchangeRate(ExchangeRateError),
    #[error("Currency error: {0}")]
    Currency(CurrencyError),
    #[error("Invalid order message: {0}")]
    Message(#[from] OrderMessageError),
    #[error("Messenger error: {0}")]
    Messenger(MessengerError),
}

impl OrderFlowError {
    pub fn unexpected<S: Into<String>>(kind: MessageKind, reason: S) -> Self {
        Self::UnexpectedMessage { kind, reason: reason.into() }
    }

    pub fn missing<S: Into<String>>(kind: MessageKind, missing: S) -> Self {
        Self::MessageDoesNotExist { kind, missing: missing.into() }
    }

    pub fn bad_request<S: Into<String>>(reason: S) -> Self {
        Self::BadRequest(reason.into())
    }

    /// Errors that commit as a no-op rather than rolling back.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::DuplicateMessage(_) | Self::DuplicateTransaction(_))
    }

    /// Inbound messages failing this way are parked until a later transition satisfies them.
    pub fn is_parkable(&self) -> bool {
        matches!(self, Self::MessageDoesNotExist { .. })
    }
}

impl From<WalletError> for OrderFlowError {
    fn from(e: WalletError) -> Self {
        match e {
            WalletError::DustAmount(amount) => Self::DustAmount(amount),
            WalletError::InsufficientFunds { needed, available } => Self::InsufficientFunds { needed, available },
            e => Self::Wallet(e),
        }
    }
}

impl From<EscrowError> for OrderFlowError {
    fn from(e: EscrowError) -> Self {
        match e {
            EscrowError::Wallet(w) => Self::from(w),
            e => Self::Escrow(e),
        }
    }
}

impl From<CurrencyError> for OrderFlowError {
    fn from(e: CurrencyError) -> Self {
        match e {
            CurrencyError::CurrencyDefinitionUndefined(code) => Self::CurrencyDefinitionUndefined(code),
            CurrencyError::InsufficientPrecision(value) => Self::CurrencyValueInsufficientPrecision(value),
            e => Self::Currency(e),
        }
    }
}

impl From<ExchangeRateError> for OrderFlowError {
    fn from(e: ExchangeRateError) -> Self {
        match e {
            ExchangeRateError::Currency(c) => Self::from(c),
            e => Self::ExchangeRate(e),
        }
    }
}

impl From<MessengerError> for OrderFlowError {
    fn from(e: MessengerError) -> Self {
        match e {
            MessengerError::Transport(TransportError::PeerUnreachable(peer)) => Self::PeerUnreachable(peer),
            MessengerError::Store(s) => Self::Store(s),
            e => Self::Messenger(e),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn subsystem_errors_map_onto_the_taxonomy() {
        let e = OrderFlowError::from(WalletError::DustAmount(Amount::from(100u64)));
        assert!(matches!(e, OrderFlowError::DustAmount(a) if a == Amount::from(100u64)));
        let e = OrderFlowError::from(EscrowError::Wallet(WalletError::InsufficientFunds {
            needed: Amount::from(10u64),
            available: Amount::from(5u64),
        }));
        assert!(matches!(e, OrderFlowError::InsufficientFunds { .. }));
        let undefined = CurrencyError::CurrencyDefinitionUndefined("XYZ".into());
        let e = OrderFlowError::from(ExchangeRateError::Currency(undefined));
        assert!(matches!(e, OrderFlowError::CurrencyDefinitionUndefined(c) if c == "XYZ"));
        let e = OrderFlowError::from(CurrencyError::InsufficientPrecision("1.5".into()));
        assert!(matches!(e, OrderFlowError::CurrencyValueInsufficientPrecision(_)));
        let e = OrderFlowError::from(MessengerError::Transport(TransportError::PeerUnreachable(PeerId::new("p"))));
        assert!(matches!(e, OrderFlowError::PeerUnreachable(_)));
    }

    #[test]
    fn classification() {
        assert!(OrderFlowError::DuplicateMessage(MessageKind::OrderComplete).is_duplicate());
        assert!(OrderFlowError::DuplicateTransaction("t".into()).is_duplicate());
        assert!(OrderFlowError::missing(MessageKind::PaymentSent, "ORDER_OPEN").is_parkable());
        assert!(!OrderFlowError::unexpected(MessageKind::OrderCancel, "direct").is_parkable());
        assert!(!OrderFlowError::ChangedMessage(MessageKind::OrderOpen).is_duplicate());
    }
}
