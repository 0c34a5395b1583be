//! Alert delivery: the quiescence gate and the sink implementations.

pub mod gate;
pub mod notifier;

pub use gate::AlertGate;
pub use notifier::{AlertSink, SinkError, SinkRegistry};
