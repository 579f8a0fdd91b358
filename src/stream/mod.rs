//! Buffering primitives
//!
//! * [`ReadBuffer`]: fixed receive window with incremental line scanning
//! * [`WriteQueue`]: FIFO of outbound chunks with partial-write tracking

mod read_buffer;
mod write_queue;

pub use read_buffer::{ReadBuffer, READ_BUFFER_SIZE};
pub use write_queue::{Payload, WriteQueue};
