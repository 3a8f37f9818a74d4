//! Event notification system.
//!
//! Each component owns its own [`SubscriberRegistry`]; there is no global bus.

pub mod subscriber;

pub use subscriber::{Event, SubscriberRegistry, SubscriptionHandle};
