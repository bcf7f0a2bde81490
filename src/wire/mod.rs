//! Wire protocol: the single TLS byte stream's frame codec (C4) and the
//! JSON control messages exchanged over it (spec.md §4.4, §6).

pub mod frame;
pub mod messages;

pub use frame::{read_message, write_message, MAX_BLOCK_SIZE, MAX_JSON_FRAME_LEN};
pub use messages::{BlockErrorCode, ControlMessage, FileIndexEntry, IgnoreConfigWire, TaskReportStatus};

// vim: ts=4
