//! Agora Engine
//!
//! The order-lifecycle core of an Agora marketplace node. Buyers, vendors and moderators each run a node; orders
//! move between them as signed messages, and payments sit in escrow addresses until the parties agree where the
//! money goes. There is no central coordinator.
//!
//! The library is divided into these sections:
//! 1. The order processor ([`order_flow`]). [`OrderFlowApi`] is the only thing that changes an order. It applies
//!    messages from peers, transactions from wallets and actions by the local user, all against one transition
//!    lattice.
//! 2. Order storage ([`mod@db`]). SQLite via `sqlx`, reached through a [`StoreTx`]. The row types live in
//!    [`db_types`] and are public.
//! 3. The collaborators the processor is built from: [`order_messages`] (signed payloads), [`messenger`]
//!    (at-least-once delivery), [`escrow`] (multisig releases), [`ratings`], [`exchange_rates`] and [`wallet`]. The
//!    contracts they need from the outside world are in [`traits`].
//!
//! The engine also publishes events when orders change ([`events`]). A node can subscribe to them on the
//! [`EventBus`], or register callbacks through [`events::EventHooks`].
pub mod db;
pub mod db_types;
pub mod escrow;
pub mod events;
pub mod exchange_rates;
pub mod helpers;
pub mod messenger;
pub mod order_flow;
pub mod order_messages;
pub mod ratings;
pub mod traits;
pub mod wallet;

#[cfg(any(feature = "test_utils", test))]
pub mod test_utils;

pub use db::{SqliteDatabase, StoreError, StoreTx};
pub use events::EventBus;
pub use order_flow::{
    ActionOutcome,
    DisputeSplit,
    ItemReview,
    ModeratorInfo,
    OrderFlowApi,
    OrderFlowConfig,
    OrderFlowError,
    ProcessOutcome,
    PurchaseRequest,
};
