//! Wire protocol for the remote commander.
//!
//! Messages are serialized with [`postcard`] and framed with a fixed-width
//! decimal length prefix, optionally base64 encoded, suitable for any
//! reliable byte stream (pipes, sockets, ssh, serial lines).

mod codec;
mod message;
mod messenger;
mod stream;
mod value;

pub use codec::{Encoding, LEN_DIGITS, MAX_FRAME, frame, parse_len, unframe};
pub use message::{
    ASYNC, BaseCmd, CmdFinish, CmdId, CmdTraceBack, MANAGE, Message, Mode, NOHUP, START, STARTED,
    StdStream, bump_cmd_id, force_cmd_id, next_cmd_id, peek_cmd_id,
};
pub use messenger::{Messenger, Received};
pub use stream::{InStream, OutStream, pipe, poll_readable};
pub use value::Value;
