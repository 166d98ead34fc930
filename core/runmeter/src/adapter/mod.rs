//! Power adapters: external processes that publish power or energy readings.
//!
//! The hub side ([`hub`]) subscribes to the adapters during a run. The publisher
//! side ([`publisher`]) is used by the adapter processes themselves.

pub mod hub;
pub mod protocol;
pub mod publisher;
pub mod reading;
pub mod retry;

pub use hub::{AdapterConnection, HubSettings, PowerAdapterHub};
pub use publisher::{AdapterServer, Publisher};
pub use reading::validate;
