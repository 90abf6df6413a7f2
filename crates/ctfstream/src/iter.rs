//! Element sequences and their iterators.

use std::cmp::Ordering;
use std::sync::Arc;

use ctfstream_metadata::TraceType;

use crate::builder::build_pkt_proc;
use crate::elem::Element;
use crate::error::{BuildError, DecodingError};
use crate::proc::PktProc;
use crate::source::DataSourceFactory;
use crate::vm::{Vm, VmPos};

/// A lazily decoded sequence of elements over a stream of packets.
///
/// Creating the sequence compiles the trace type into decoding procedures;
/// [`ElementSequence::iter`] then creates independent iterators, each with
/// its own data source from the factory.
pub struct ElementSequence {
    trace_type: Arc<TraceType>,
    pkt_proc: Arc<PktProc>,
    factory: Arc<dyn DataSourceFactory>,
}

impl ElementSequence {
    pub fn new(
        trace_type: Arc<TraceType>,
        factory: Arc<dyn DataSourceFactory>,
    ) -> Result<Self, BuildError> {
        let pkt_proc = Arc::new(build_pkt_proc(&trace_type)?);
        Ok(Self {
            trace_type,
            pkt_proc,
            factory,
        })
    }

    pub fn trace_type(&self) -> &Arc<TraceType> {
        &self.trace_type
    }

    pub fn iter(&self) -> ElementSequenceIterator {
        ElementSequenceIterator {
            vm: Vm::new(
                Arc::clone(&self.pkt_proc),
                self.factory.create_data_source(),
            ),
        }
    }
}

/// A pull-based iterator over the elements of an element sequence.
///
/// Not a [`std::iter::Iterator`]: each element borrows from the iterator
/// and is only valid until the next advance.
pub struct ElementSequenceIterator {
    vm: Vm,
}

impl ElementSequenceIterator {
    /// Decode and return the next element, or `None` at the end of the
    /// sequence.
    pub fn next_element(&mut self) -> Result<Option<Element<'_>>, DecodingError> {
        if self.vm.next_elem()? {
            Ok(self.vm.current())
        } else {
            Ok(None)
        }
    }

    /// The element returned by the last advance, if any.
    pub fn current(&self) -> Option<Element<'_>> {
        self.vm.current()
    }

    /// Offset of the current element within the element sequence, in bits.
    pub fn offset_bits(&self) -> u64 {
        self.vm.offset
    }

    /// Monotonic mark of the current element within its packet. Two
    /// iterators over the same sequence compare equal when their
    /// `(offset, mark)` pairs match.
    pub fn mark(&self) -> u64 {
        self.vm.mark
    }

    pub fn is_at_end(&self) -> bool {
        self.vm.at_end
    }

    /// Jump to the packet starting at `byte_offset` and advance once. The
    /// returned element is that packet's beginning, or `None` when the
    /// offset is at or past the end of the sequence.
    ///
    /// `byte_offset` must be the first byte of a packet; the engine never
    /// seeks below packet granularity.
    pub fn seek_packet(
        &mut self,
        byte_offset: u64,
    ) -> Result<Option<Element<'_>>, DecodingError> {
        self.vm.seek_packet(byte_offset);
        self.next_element()
    }

    /// Capture the complete decoding position, including the current
    /// element.
    pub fn save_position(&self) -> IteratorPosition {
        IteratorPosition {
            pos: self.vm.pos.clone(),
            offset: self.vm.offset,
            mark: self.vm.mark,
            at_end: self.vm.at_end,
        }
    }

    /// Restore a position previously saved from an iterator over the same
    /// element sequence.
    pub fn restore_position(&mut self, position: &IteratorPosition) {
        self.vm.pos = position.pos.clone();
        self.vm.offset = position.offset;
        self.vm.mark = position.mark;
        self.vm.at_end = position.at_end;
    }
}

/// An opaque saved iterator position.
///
/// Positions are ordered by their place in the element sequence and may
/// outlive the iterator they were saved from.
#[derive(Clone)]
pub struct IteratorPosition {
    pub(crate) pos: VmPos,
    pub(crate) offset: u64,
    pub(crate) mark: u64,
    pub(crate) at_end: bool,
}

impl IteratorPosition {
    pub fn offset_bits(&self) -> u64 {
        self.offset
    }

    pub fn mark(&self) -> u64 {
        self.mark
    }
}

impl PartialEq for IteratorPosition {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset && self.mark == other.mark
    }
}

impl Eq for IteratorPosition {}

impl PartialOrd for IteratorPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IteratorPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.offset, self.mark).cmp(&(other.offset, other.mark))
    }
}
