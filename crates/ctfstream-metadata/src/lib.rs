//! Trace-type data model for the `ctfstream` decoder.
//!
//! A [`TraceType`] is a frozen description of every data stream a trace can
//! contain: the packet-header structure, the clock types, and one
//! [`DataStreamType`] per stream class, each owning its packet-context and
//! event-record structures. Leaf fields are described by [`DataType`], a
//! closed set of fixed-length, variable-length, string, array, BLOB,
//! structure, variant, and optional types.
//!
//! The model is inert: it never touches trace bytes. The `ctfstream` crate
//! compiles it into a decoding procedure and runs that against a stream.
//!
//! Compound nodes are shared through [`std::sync::Arc`] so a compiled
//! decoder can reference them without borrowing the trace type.

mod clock;
mod data_loc;
mod data_type;
mod error;
mod range_set;
mod trace;
mod uuid;

pub use clock::ClockType;
pub use data_loc::{DataLocation, Scope};
pub use data_type::{
    DataType, DynamicLengthArrayType, DynamicLengthBlobType, DynamicLengthStringType,
    FixedLengthBitArrayType, FixedLengthBitMapType, FixedLengthBoolType, FixedLengthFloatType,
    FixedLengthSIntType, FixedLengthUIntType, NullTerminatedStringType, OptionalBoolSelType,
    OptionalSIntSelType, OptionalUIntSelType, StaticLengthArrayType, StaticLengthBlobType,
    StaticLengthStringType, StrEncoding, StructMemberType, StructType, UnsignedIntegerRole,
    VariableLengthSIntType, VariableLengthUIntType, VariantSIntSelType, VariantTypeOption,
    VariantUIntSelType,
};
pub use error::MetadataError;
pub use range_set::{IntegerRange, IntegerRangeSet};
pub use trace::{DataStreamType, EventRecordType, TraceType};
pub use uuid::Uuid;

/// Byte order of a fixed-length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}
