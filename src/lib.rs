#![doc = include_str!("../README.md")]

pub mod bridge;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod envelope;
pub mod messages;
pub mod publisher;
pub mod router;
pub mod source;
pub mod store;
pub mod strategy;
pub mod transport;

#[doc(inline)]
pub use envelope::Envelope;

#[doc(inline)]
pub use transport::{Transport, TransportError, TransportErrorKind};

#[doc(inline)]
pub use bridge::{Bridge, BridgeHook, DefaultBridgeHook};

#[doc(inline)]
pub use consumer::{Consumer, ConsumerError, ConsumerErrorKind, DeliveryOutcome};

#[doc(inline)]
pub use publisher::Publisher;

#[doc(inline)]
pub use router::{RouteError, RouteErrorKind, StrategyRouter};
