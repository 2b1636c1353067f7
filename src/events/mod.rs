//! Process-wide event bus: a bounded ring of typed events plus synchronous
//! fan-out to listeners (§4.A).

mod bus;
mod filter;

pub use bus::{EventBus, create_event_bus};
pub use filter::EventFilter;
