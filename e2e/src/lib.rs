//! Shared helpers for the multi-node cucumber scenarios in `tests/`.
pub mod helpers;
