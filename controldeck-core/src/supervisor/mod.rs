//! Status polling and action dispatch over the services held by the
//! lifecycle registry.

pub mod dispatcher;
pub mod poller;
pub mod snapshot;

pub use dispatcher::{Action, ActionDispatcher, ActionOutcome, ActionRecord};
pub use poller::{CheckPhase, PollerConfig, StatusPoller};
pub use snapshot::{ServiceState, StatusEntry, StatusSnapshot};
