//! Master side of the remote commander.
//!
//! A [`CommanderMaster`] drives a slave agent over any pair of byte
//! streams: the stdio of a local process, an `ssh` session, or a Unix
//! socket. Callables on the slave are addressed by dotted names and run in
//! one of four modes:
//!
//! | Builder                     | Runs                      | Returns               |
//! |-----------------------------|---------------------------|-----------------------|
//! | [`CommanderMaster::call`]   | forked child              | after it finishes     |
//! | [`CommanderMaster::manage`] | inside the slave process  | after it finishes     |
//! | [`CommanderMaster::spawn`]  | forked child              | after the first reply |
//! | [`CommanderMaster::nohup`]  | detached daemon           | after the first reply |
//!
//! # Quick start
//!
//! ```no_run
//! use rcmd::{Encoding, Transport, Value};
//!
//! # fn main() -> rcmd::Result<()> {
//! let mut master = Transport::spawn("ssh", ["host", "rcmd-agent", "agent"], Encoding::Raw)?.connect()?;
//!
//! let code = master.call("shell").arg("make -C /src").send()?.into_value()?;
//! assert_eq!(code, Value::Int(0));
//!
//! // Survives the ssh session; reattach later with `CmdMaster::set_commander`.
//! let job = master.nohup("shell").arg("./long-build.sh").send()?;
//! job.save("job.json".as_ref())?;
//! master.disconnect()?;
//! # Ok(())
//! # }
//! ```

mod cmd;
mod error;
mod master;
mod transport;

pub use cmd::CmdMaster;
pub use error::{Error, Result};
pub use master::{CmdBuilder, CommanderMaster, DEFAULT_TIMEOUT, HANDSHAKE_TIMEOUT};
pub use rcmd_proto::{CmdId, Encoding, Message, StdStream, Value};
pub use transport::Transport;
