//! dgbus-services: the receive path from socket to subscriber.
//!
//! Data flows leaf-first: `listener` receives datagrams, `processor`
//! decodes them and drives the `ledger`, and completed messages go to
//! the `router`, which fans them out to subscribed handlers.

pub mod executor;
pub mod ledger;
pub mod listener;
pub mod processor;
pub mod router;
pub mod stats;

pub use executor::{BackgroundExecutor, Submitted};
pub use ledger::{Assembled, LedgerError, ReassemblyKey, ReassemblyLedger};
pub use listener::{ListenerError, ListenerServer, ServerState};
pub use processor::{DatagramProcessor, ProcessError};
pub use router::{DispatchRouter, FnHandler, Handler, HandlerRegistry, TopicRegistry};
pub use stats::{DeliveryStats, StatsSnapshot};
