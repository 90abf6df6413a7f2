use ctfstream_metadata::ByteOrder;

/// Errors raised while decoding a stream.
///
/// Every variant carries `offset_bits`, the head offset within the element
/// sequence (in bits) at the moment the condition was detected. A decoding
/// error aborts the current iteration step; the engine performs no retry.
#[derive(Debug, thiserror::Error)]
pub enum DecodingError {
    /// The data source ran out of bytes in the middle of a packet.
    #[error("premature end of data at bit offset {offset_bits}: {needed_bits} more bits needed")]
    PrematureEndOfData { offset_bits: u64, needed_bits: u64 },

    #[error(
        "cannot decode {needed_bits} bits at bit offset {offset_bits}: \
         only {rem_bits} bits of packet content remain"
    )]
    CannotDecodeBeyondPacketContent {
        offset_bits: u64,
        needed_bits: u64,
        rem_bits: u64,
    },

    #[error(
        "expected packet total length {len_bits} (bit offset {offset_bits}) \
         is not a multiple of 8"
    )]
    ExpectedPacketTotalLengthNotMultipleOf8 { offset_bits: u64, len_bits: u64 },

    #[error(
        "expected packet total length {total_bits} is less than expected \
         packet content length {content_bits} (bit offset {offset_bits})"
    )]
    ExpectedPacketTotalLengthLessThanContentLength {
        offset_bits: u64,
        total_bits: u64,
        content_bits: u64,
    },

    #[error(
        "expected packet length {len_bits} is less than the current offset \
         {head_bits} within the packet (bit offset {offset_bits})"
    )]
    ExpectedPacketLengthLessThanOffsetInPacket {
        offset_bits: u64,
        len_bits: u64,
        head_bits: u64,
    },

    #[error("unknown data stream type id {id} (bit offset {offset_bits})")]
    UnknownDataStreamType { offset_bits: u64, id: u64 },

    #[error("unknown event record type id {id} (bit offset {offset_bits})")]
    UnknownEventRecordType { offset_bits: u64, id: u64 },

    #[error("no variant option matches unsigned selector value {selector} (bit offset {offset_bits})")]
    InvalidUnsignedVariantSelector { offset_bits: u64, selector: u64 },

    #[error("no variant option matches signed selector value {selector} (bit offset {offset_bits})")]
    InvalidSignedVariantSelector { offset_bits: u64, selector: i64 },

    /// Two consecutive bit arrays share a byte but disagree on byte order.
    #[error(
        "byte order changed from {expected:?} to {found:?} within a byte \
         (bit offset {offset_bits})"
    )]
    ByteOrderChangeWithinByte {
        offset_bits: u64,
        expected: ByteOrder,
        found: ByteOrder,
    },

    /// A variable-length integer carries more than 64 significant bits.
    #[error("oversized variable-length integer (bit offset {offset_bits})")]
    OversizedVariableLengthInteger { offset_bits: u64 },
}

impl DecodingError {
    /// Head offset within the element sequence, in bits, when the error was
    /// detected.
    pub fn offset_bits(&self) -> u64 {
        match self {
            DecodingError::PrematureEndOfData { offset_bits, .. }
            | DecodingError::CannotDecodeBeyondPacketContent { offset_bits, .. }
            | DecodingError::ExpectedPacketTotalLengthNotMultipleOf8 { offset_bits, .. }
            | DecodingError::ExpectedPacketTotalLengthLessThanContentLength {
                offset_bits, ..
            }
            | DecodingError::ExpectedPacketLengthLessThanOffsetInPacket { offset_bits, .. }
            | DecodingError::UnknownDataStreamType { offset_bits, .. }
            | DecodingError::UnknownEventRecordType { offset_bits, .. }
            | DecodingError::InvalidUnsignedVariantSelector { offset_bits, .. }
            | DecodingError::InvalidSignedVariantSelector { offset_bits, .. }
            | DecodingError::ByteOrderChangeWithinByte { offset_bits, .. }
            | DecodingError::OversizedVariableLengthInteger { offset_bits } => *offset_bits,
        }
    }
}

/// Errors raised while compiling a trace type into decoding procedures.
///
/// These surface from [`crate::ElementSequence::new`], before any decoding
/// starts.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// The named field does not exist, or is not decoded before the field
    /// that references it.
    #[error("cannot resolve data location `{location}`")]
    UnresolvableDataLocation { location: String },

    /// The referenced field cannot supply a length or selector value.
    #[error("data location `{location}` does not target an integer or boolean field")]
    InvalidReferentKind { location: String },
}
