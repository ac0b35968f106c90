#![forbid(unsafe_code)]

pub mod rabbitmq;

pub use rabbitmq::{
    BrokerError, BrokerPublisher, BrokerSession, BrokerTopology, SiteConsumer, SiteDelivery,
};
