// Event distribution
//
// A typed broker that fans events out to independent subscribers. Each
// subscriber gets its own bounded buffer, and a construction-time policy
// decides what happens when one of them falls behind.

mod broker;
mod event;

pub use broker::{
    BackpressurePolicy, Broker, BrokerMetrics, BrokerOptions, Subscription, DEFAULT_BLOCK_TIMEOUT,
    DEFAULT_BUFFER_SIZE,
};
pub use event::{Event, EventKind};
