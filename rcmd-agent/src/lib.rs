//! Slave agent of the remote commander.
//!
//! The agent takes over its stdin and stdout as the transport to a master
//! and executes the commands it receives: inline (`manage`), in a forked
//! child (default and `async`), or under a detached relay that survives the
//! loss of the master (`nohup`).
//!
//! Embedders can register their own callables before serving:
//!
//! ```no_run
//! use rcmd_agent::{AgentConfig, Args, CallResult, Slave};
//! use rcmd_proto::{Encoding, Value};
//!
//! fn main() -> std::io::Result<()> {
//!     let mut slave = Slave::from_stdio(Encoding::Raw, AgentConfig::from_env())?;
//!     slave.register("answer", |_: &mut Slave, _: Args| -> CallResult { Ok(Value::Int(42)) });
//!     slave.run()
//! }
//! ```

pub mod cmds;
pub mod config;
pub mod daemon;
pub mod logging;
mod slave;
mod sys;

pub use config::AgentConfig;
pub use slave::{Args, CallError, CallResult, Callable, CmdSlave, Namespace, Scope, Slave, Symbol};
