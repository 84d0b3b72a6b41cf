//! Test host side of the runner protocol
//!
//! A [`RequestHandler`] accepts (or makes) the connection to the runner,
//! negotiates the protocol version and then turns each request into a call on
//! a [`DiscoveryManager`] or [`ExecutionManager`]. Everything the managers
//! report is queued and sent back to the runner in the order it was reported.

mod debugger;
mod error;
mod events;
mod handler;
pub mod managers;
mod session;
mod state;

pub use error::DebuggerError;
pub use handler::{HandlerOptions, RequestHandler};
pub use managers::{
    Diagnostics, DiscoveryEventsHandler, DiscoveryManager, ExecutionManager, ManagerFactory,
    MessageLogger, RunEventsHandler, TestRunRequest, TestRunTarget,
};
pub use state::{SessionState, Termination};
