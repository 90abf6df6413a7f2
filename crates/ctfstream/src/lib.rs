//! Pull-based decoder for CTF binary trace streams.
//!
//! A trace stream is a sequence of self-describing packets; each packet
//! holds a header, a context, and event records, laid out at bit
//! granularity by a per-trace schema (a
//! [`ctfstream_metadata::TraceType`]). This crate compiles the schema into
//! flat decoding procedures and walks a stream with a single-threaded
//! virtual machine, yielding one typed [`Element`] per iterator advance:
//! packet and event-record markers, decoded field values, substrings, end
//! markers.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ctfstream::{Element, ElementSequence, SliceDataSourceFactory};
//! use ctfstream_metadata::{
//!     ByteOrder, FixedLengthUIntType, StructMemberType, StructType, TraceType,
//! };
//!
//! let header = StructType::new(
//!     8,
//!     vec![StructMemberType::new(
//!         "magic",
//!         Arc::new(FixedLengthUIntType::new(32, 32, ByteOrder::LittleEndian)?.into()),
//!     )],
//! )?;
//! let trace_type = Arc::new(TraceType::new(
//!     1,
//!     8,
//!     None,
//!     Some(Arc::new(header.into())),
//!     vec![],
//!     vec![],
//! )?);
//!
//! let bytes = vec![0xC1, 0x1F, 0xFC, 0xC1];
//! let seq = ElementSequence::new(trace_type, Arc::new(SliceDataSourceFactory::new(bytes)))?;
//! let mut it = seq.iter();
//! while let Some(elem) = it.next_element()? {
//!     if let Element::UnsignedInt { value, .. } = elem {
//!         println!("magic: {value:#x}");
//!     }
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! An element is only valid until the next advance; callers copy what they
//! keep. Iterators support packet-granular seeking
//! ([`ElementSequenceIterator::seek_packet`]) and position save/restore
//! ([`ElementSequenceIterator::save_position`]).

pub use ctfstream_metadata as metadata;

mod bitreader;
mod builder;
mod elem;
mod error;
mod iter;
mod proc;
mod source;
mod vm;

pub use elem::{Element, PACKET_MAGIC_NUMBER};
pub use error::{BuildError, DecodingError};
pub use iter::{ElementSequence, ElementSequenceIterator, IteratorPosition};
pub use source::{DataSource, DataSourceFactory, SliceDataSourceFactory};
