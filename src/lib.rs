pub mod agent;
pub mod ci;
pub mod clock;
pub mod config;
pub mod errors;
pub mod git;
pub mod github;
pub mod logging;
pub mod orchestrator;
pub mod phase;
pub mod prompts;
pub mod shepherd_config;
pub mod split;
pub mod state;
pub mod stream;
pub mod tracker;
pub mod ui;
pub mod util;
pub mod workflow;

/// In-memory collaborators for driving the orchestrator without git, GitHub
/// or an agent binary. Built for unit tests and behind the `testing` feature.
#[cfg(any(test, feature = "testing"))]
pub mod testing;
