use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::serial::{error::SerialPortError, SerialMessageBytes};

/// Lines longer than this are dropped.
/// The device's largest frame (a full configs dump) is well below it.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 16 * 1024;

/// This codec has a configurable delimiter character for reading,
/// and optionally adds a character to each line it encodes.
#[derive(Debug)]
pub struct LinesCodec {
    /// How far we have looked for a newline into the buffer
    cursor: usize,

    /// How to delimit incoming byte streams.
    /// This delimiter is not included in the yielded frames.
    read_delimiter: u8,

    /// If provided, which byte to append when writing (encoding) messages.
    /// If `None`, forwards the data as-is.
    write_delimiter: Option<u8>,

    /// Frames may not grow beyond this.
    max_length: usize,

    /// Set while skipping the rest of an overlong frame.
    discarding: bool,
}

impl LinesCodec {
    /// Create a new codec.
    pub fn new(read_delimiter: u8, write_delimiter: Option<u8>) -> Self {
        Self {
            cursor: 0,
            read_delimiter,
            write_delimiter,
            max_length: DEFAULT_MAX_LINE_LENGTH,
            discarding: false,
        }
    }

    /// Limit how long a single frame may be.
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }
}

impl Default for LinesCodec {
    fn default() -> Self {
        Self::new(b'\n', Some(b'\n'))
    }
}

impl Decoder for LinesCodec {
    type Item = SerialMessageBytes;
    type Error = SerialPortError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let read_to = src.len();

            let look_at = &src[self.cursor..read_to];

            match look_at.iter().position(|&byte| byte == self.read_delimiter) {
                Some(position) if self.discarding => {
                    // Drop the tail of the overlong frame, delimiter included,
                    // then look for a proper frame in what remains.
                    src.advance(self.cursor + position + 1);
                    self.cursor = 0;
                    self.discarding = false;
                }
                Some(position) => {
                    // Since we might "start late" in the buffer (from the cursor),
                    // the "global" position within the buffer has to be calculated.
                    let actual_position = self.cursor + position;

                    // Next time we need to start over.
                    self.cursor = 0;

                    // Split at the delimiter, getting a slice of the bytes before it.
                    let line = src.split_to(actual_position);

                    // Discard the delimiter by advancing the source buffer beyond it.
                    src.advance(1);

                    let line = match line.last() {
                        Some(b'\r') => &line[..line.len() - 1],
                        _ => &line[..],
                    };

                    return Ok(Some(line.to_vec()));
                }
                None if read_to > self.max_length => {
                    warn!(
                        "Dropping frame without delimiter after {read_to} bytes (max {})",
                        self.max_length
                    );
                    src.clear();
                    self.cursor = 0;
                    self.discarding = true;

                    return Ok(None);
                }
                None => {
                    // We did not find a full frame.
                    // The next time we are called the same buffer `src` will be provided to us (same starting point),
                    // but possibly with more data.
                    // Since our job is to find the delimiter, we don't need to re-read the bytes we have already looked at.
                    self.cursor = read_to;

                    // Indicate that we need more bytes to look at.
                    return Ok(None);
                }
            }
        }
    }
}

impl Encoder<SerialMessageBytes> for LinesCodec {
    type Error = SerialPortError;

    fn encode(&mut self, item: SerialMessageBytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item);

        // Already terminated lines are not terminated twice.
        if let Some(character) = self.write_delimiter {
            if item.last() != Some(&character) {
                dst.extend_from_slice(&[character]);
            }
        }
        Ok(())
    }
}
