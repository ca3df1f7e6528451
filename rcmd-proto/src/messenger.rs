//! Message framing over a pair of byte streams.

use std::io;
use std::time::{Duration, Instant};

use tracing::{error, trace};

use crate::codec;
use crate::message::Message;
use crate::stream::{InStream, OutStream};

/// Chunk size used when draining input.
const FLUSH_CHUNK: usize = 16384;

/// How long [`Messenger::flush_stdin`] waits for more input.
const FLUSH_WAIT: Duration = Duration::from_secs(1);

/// Outcome of [`Messenger::read_msg`].
#[derive(Debug)]
#[non_exhaustive]
pub enum Received {
    /// A complete message.
    Msg(Message),
    /// The peer closed its end.
    Closed,
    /// Nothing arrived before the deadline.
    TimedOut,
}

/// Sends and receives [`Message`]s as length-prefixed frames.
#[derive(Debug)]
pub struct Messenger {
    /// Stream messages are read from.
    input: InStream,
    /// Stream messages are written to.
    output: OutStream,
}

impl Messenger {
    /// Pairs a read stream with a write stream.
    pub const fn new(input: InStream, output: OutStream) -> Self {
        Self { input, output }
    }

    /// The read half.
    pub const fn input(&self) -> &InStream {
        &self.input
    }

    /// The write half.
    pub const fn output(&self) -> &OutStream {
        &self.output
    }

    /// Splits the messenger back into its streams.
    pub fn into_parts(self) -> (InStream, OutStream) {
        (self.input, self.output)
    }

    /// Writes one message as a single frame.
    pub fn write_msg(&mut self, msg: &Message) -> io::Result<()> {
        let frame = codec::frame(msg, self.output.encoding())?;
        self.output.write(&frame)
    }

    /// Reads one message.
    ///
    /// The length prefix is assembled a byte at a time and bytes that cannot
    /// belong to it are skipped, so terminal noise in front of a frame is
    /// tolerated. On a framing or decoding error a `MessengerError` is sent
    /// to the peer, pending input is flushed and the error is returned.
    pub fn read_msg(&mut self, timeout: Option<Duration>) -> io::Result<Received> {
        let prefix = match self.read_prefix(timeout) {
            Ok(Some(p)) if p.is_empty() => return Ok(Received::Closed),
            Ok(Some(p)) => p,
            Ok(None) => return Ok(Received::TimedOut),
            Err(e) => return Err(self.report(e)),
        };
        let encoding = self.input.encoding();
        let result = codec::parse_len(&prefix, encoding).and_then(|len| {
            let payload = self.input.read_exact_len(len)?;
            codec::unframe::<Message>(&payload, encoding)
        });
        match result {
            Ok(msg) => Ok(Received::Msg(msg)),
            Err(e) => Err(self.report(e)),
        }
    }

    /// Drains pending input, waiting up to a second for each chunk.
    pub fn flush_stdin(&mut self) -> io::Result<()> {
        while let Some(data) = self.input.read(FLUSH_CHUNK, Some(FLUSH_WAIT))? {
            if data.len() < FLUSH_CHUNK {
                break;
            }
        }
        Ok(())
    }

    /// Collects the encoded length prefix.
    ///
    /// Returns `Ok(None)` on timeout and an empty buffer on EOF.
    fn read_prefix(&mut self, timeout: Option<Duration>) -> io::Result<Option<Vec<u8>>> {
        let encoding = self.input.encoding();
        let want = encoding.prefix_len();
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut data = Vec::with_capacity(want);

        while data.len() < want {
            let left = match deadline {
                None => None,
                Some(d) => {
                    let left = d.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Ok(None);
                    }
                    Some(left)
                }
            };
            let Some(chunk) = self.input.read(1, left)? else {
                return Ok(None);
            };
            let Some(&b) = chunk.first() else {
                return Ok(Some(Vec::new()));
            };
            if encoding.is_prefix_byte(b) {
                data.push(b);
            } else {
                trace!(byte = b, "skipping noise before frame");
            }
        }
        Ok(Some(data))
    }

    /// Tells the peer about a failure and resynchronizes the input.
    fn report(&mut self, err: io::Error) -> io::Error {
        error!("messenger read failed: {err}");
        let note = Message::MessengerError(format!("Communication failed. {err}"));
        if let Err(e) = self.write_msg(&note) {
            trace!("could not report messenger failure: {e}");
        }
        if let Err(e) = self.flush_stdin() {
            trace!("flush after messenger failure: {e}");
        }
        err
    }
}
