//! Sandbox backend that launches a configured host program (a VM launcher or
//! an in-guest agent started directly) and uses its stdin/stdout as the guest
//! message channel. Everything the program writes to stderr is forwarded to
//! the log.

mod config;
mod factory;
mod process;
mod sandbox;

pub use config::ProcessConfig;
pub use factory::ProcessFactory;
pub use sandbox::ProcessSandbox;
