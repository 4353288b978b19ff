//! Command implementations for the CLI.

mod decode;
mod packet;
mod serial;
mod stream;

pub use decode::{DecodeArgs, cmd_decode};
pub use packet::cmd_packet;
pub use serial::cmd_serial;
pub use stream::{StreamArgs, cmd_stream};
