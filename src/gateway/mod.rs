//! Gateway bookkeeping: pairing local and external terminals per service.
//!
//! A gateway bridges services to some external transport. For each service
//! it keeps a [`Channel`] made of two terminals, each allocated from its own
//! fixed-capacity [`ObjectPool`](crate::memory::ObjectPool). The pools bound
//! how many services one gateway can serve.

mod channel;
mod registry;
mod service;

pub use channel::{Channel, ChannelError, Terminal, TerminalHandle, TerminalPools};
pub use registry::{ChannelRegistry, DefaultChannelRegistry};
pub use service::ServiceDescription;
