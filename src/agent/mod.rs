// Agent runtime: control-plane client, poll loop and daemon wiring
//
// The poller asks the control plane for pending actions on an adjustable
// interval, runs each through the module registry under a deadline and
// reports one result per action.

mod client;
mod daemon;
mod poller;
mod protocol;
mod scheduler;
mod state;

pub use client::RemoteClient;
pub use daemon::{open_store, run_agent_daemon};
pub use poller::{MIN_POLL_INTERVAL, Poller, PollerSettings};
pub use state::AgentState;
