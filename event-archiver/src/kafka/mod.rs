pub mod config;
pub mod consumer;
pub mod context;
pub mod types;

pub use config::ConsumerConfigBuilder;
pub use consumer::KafkaSource;
pub use types::Partition;
