//! Runner side of the test host protocol
//!
//! A [`RequestSender`] connects to a test host, performs the version
//! handshake and drives discovery and test runs, reporting what the host
//! sends back through the traits in [`handlers`].

mod error;
pub mod handlers;
mod sender;

pub use error::RunnerError;
pub use handlers::{DebuggerLauncher, DiscoveryEventsHandler, NoDebugger, RunEventsHandler, TestMessageHandler};
pub use sender::{RequestSender, SenderOptions, TestRunCriteria};
