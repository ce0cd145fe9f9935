//! # Order processor
//!
//! [`OrderFlowApi`] owns every order transition on a node. There are three kinds of input:
//!
//! * signed order messages from peers ([`OrderFlowApi::process_message`]),
//! * wallet transactions touching a payment address ([`OrderFlowApi::process_transaction`]),
//! * local actions taken by the node's user ([`OrderFlowApi::purchase`], [`OrderFlowApi::confirm`] and friends).
//!
//! All three end the same way. The transition is checked against the [`lattice`] for the role that authored it and
//! stored together with the order's recomputed state. Then it is committed, or rolled back if anything failed.
//! Outgoing messages and events are only released on commit.
mod actions;
mod api;
mod errors;
mod handlers;
pub mod lattice;
mod payments;
pub mod validation;

pub use actions::{ActionOutcome, DisputeSplit, ItemReview, ModeratorInfo, PurchaseRequest, ORDER_VERSION};
pub use api::{OrderFlowApi, OrderFlowConfig, ProcessOutcome};
pub use errors::OrderFlowError;
pub use lattice::{check, derive_state};
