//! Codec module - typed binary readers/writers and the field-table
//! grammar.
//!
//! This is the lowest layer of the wire core: everything above it speaks
//! in terms of [`ByteReader`] / [`FrameBuilder`] cursors over frame
//! payloads.

mod reader;
mod value;
mod writer;

pub use reader::{ByteReader, MAX_TIMESTAMP_SECS};
pub use value::{assert_name, assert_not_empty, is_valid_table_key, Decimal, FieldTable, FieldValue};
pub use writer::{FrameBuilder, FRAME_OVERHEAD, FRAME_PREFIX};
