pub mod deps;
pub mod events;
pub mod nats;
pub mod test_dependencies;

pub use deps::PipelineDeps;
pub use events::{EventEnvelope, EventPublisher, OutboundEvent};
pub use nats::{LoggingPublisher, NatsClientPublisher, NatsPublisher, TestNats};
