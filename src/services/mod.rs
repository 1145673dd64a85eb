pub mod cache;
pub mod node;
pub mod proxy;
pub mod sessions;
pub mod sniffer;

pub use cache::{Cache, Item, Outcome, PopulateGuard};
pub use node::{ConnectionSlot, Node};
pub use proxy::Proxy;
pub use sessions::{Sessions, UserSession, Variant};
pub use sniffer::CapturedResponse;
