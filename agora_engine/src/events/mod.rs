//! In-process event bus. Producers publish after their store transaction commits; consumers subscribe per event type
//! or to the whole [`DomainEvent`] stream.
mod bus;
mod channel;
mod event_types;
mod hooks;

pub use bus::{BusEvent, EventBus};
pub use channel::{EventHandler, Handler};
pub use event_types::*;
pub use hooks::{EventHandlers, EventHooks};
