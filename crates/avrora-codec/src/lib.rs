//! Message framing for avrora transports.
//!
//! A logical message is carried as a sequence of frames, each a 4-byte
//! big-endian length followed by that many payload bytes, terminated by a
//! zero-length frame. [`FrameEncoder`] and [`FrameDecoder`] operate on
//! in-memory buffers; [`read_framed`] and [`write_framed`] adapt the same
//! format to async byte streams.

mod error;
mod framing;
mod io;

pub use error::*;
pub use framing::*;
pub use io::*;
