use std::collections::HashSet;
use std::sync::Arc;

use crate::{ByteOrder, DataLocation, IntegerRangeSet, MetadataError};

fn check_align(align_bits: u32) -> Result<(), MetadataError> {
    if align_bits == 0 || !align_bits.is_power_of_two() {
        return Err(MetadataError::InvalidAlignment(align_bits));
    }
    Ok(())
}

fn check_len(len_bits: u32) -> Result<(), MetadataError> {
    if !(1..=64).contains(&len_bits) {
        return Err(MetadataError::InvalidLength(len_bits));
    }
    Ok(())
}

/// Semantic role of an unsigned integer field.
///
/// Roles tell the decoder which protocol quantity a field carries; the
/// procedure builder turns each role into a side-effect instruction after
/// the field's read instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsignedIntegerRole {
    PacketMagicNumber,
    DataStreamTypeId,
    DataStreamId,
    PacketTotalLength,
    PacketContentLength,
    PacketSequenceNumber,
    DiscardedEventRecordCounterSnapshot,
    PacketEndDefaultClockTimestamp,
    DefaultClockTimestamp,
    EventRecordTypeId,
}

/// Encoding of a string type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrEncoding {
    Utf8,
    Utf16,
    Utf32,
}

impl StrEncoding {
    /// Size of one code unit in bytes; a null terminator is one all-zero
    /// unit.
    pub fn unit_bytes(self) -> u32 {
        match self {
            StrEncoding::Utf8 => 1,
            StrEncoding::Utf16 => 2,
            StrEncoding::Utf32 => 4,
        }
    }
}

/// A fixed-length bit array: 1 to 64 bits at a given alignment and byte
/// order. The base layout of every fixed-length type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedLengthBitArrayType {
    pub len_bits: u32,
    pub align_bits: u32,
    pub byte_order: ByteOrder,
    /// Reverse the bit order within each byte before interpretation.
    pub bit_reversed: bool,
}

impl FixedLengthBitArrayType {
    pub fn new(len_bits: u32, align_bits: u32, byte_order: ByteOrder) -> Result<Self, MetadataError> {
        check_len(len_bits)?;
        check_align(align_bits)?;
        Ok(Self {
            len_bits,
            align_bits,
            byte_order,
            bit_reversed: false,
        })
    }

    pub fn with_bit_reversed(mut self) -> Self {
        self.bit_reversed = true;
        self
    }
}

/// A fixed-length bit map: a bit array whose bits carry named flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedLengthBitMapType {
    pub len_bits: u32,
    pub align_bits: u32,
    pub byte_order: ByteOrder,
    pub bit_reversed: bool,
    /// Flag name to the set of bit indexes it covers.
    pub flags: Vec<(String, IntegerRangeSet<u64>)>,
}

impl FixedLengthBitMapType {
    pub fn new(
        len_bits: u32,
        align_bits: u32,
        byte_order: ByteOrder,
        flags: Vec<(String, IntegerRangeSet<u64>)>,
    ) -> Result<Self, MetadataError> {
        check_len(len_bits)?;
        check_align(align_bits)?;
        Ok(Self {
            len_bits,
            align_bits,
            byte_order,
            bit_reversed: false,
            flags,
        })
    }
}

/// A fixed-length boolean: decoded like an unsigned bit array, any non-zero
/// value is true.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedLengthBoolType {
    pub len_bits: u32,
    pub align_bits: u32,
    pub byte_order: ByteOrder,
    pub bit_reversed: bool,
}

impl FixedLengthBoolType {
    pub fn new(len_bits: u32, align_bits: u32, byte_order: ByteOrder) -> Result<Self, MetadataError> {
        check_len(len_bits)?;
        check_align(align_bits)?;
        Ok(Self {
            len_bits,
            align_bits,
            byte_order,
            bit_reversed: false,
        })
    }
}

/// A fixed-length unsigned integer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedLengthUIntType {
    pub len_bits: u32,
    pub align_bits: u32,
    pub byte_order: ByteOrder,
    pub bit_reversed: bool,
    pub roles: Vec<UnsignedIntegerRole>,
}

impl FixedLengthUIntType {
    pub fn new(len_bits: u32, align_bits: u32, byte_order: ByteOrder) -> Result<Self, MetadataError> {
        check_len(len_bits)?;
        check_align(align_bits)?;
        Ok(Self {
            len_bits,
            align_bits,
            byte_order,
            bit_reversed: false,
            roles: Vec::new(),
        })
    }

    pub fn with_role(mut self, role: UnsignedIntegerRole) -> Self {
        self.roles.push(role);
        self
    }

    pub fn with_bit_reversed(mut self) -> Self {
        self.bit_reversed = true;
        self
    }
}

/// A fixed-length signed integer (two's complement).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedLengthSIntType {
    pub len_bits: u32,
    pub align_bits: u32,
    pub byte_order: ByteOrder,
    pub bit_reversed: bool,
}

impl FixedLengthSIntType {
    pub fn new(len_bits: u32, align_bits: u32, byte_order: ByteOrder) -> Result<Self, MetadataError> {
        check_len(len_bits)?;
        check_align(align_bits)?;
        Ok(Self {
            len_bits,
            align_bits,
            byte_order,
            bit_reversed: false,
        })
    }
}

/// A fixed-length IEEE 754 floating point number (32 or 64 bits).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedLengthFloatType {
    pub len_bits: u32,
    pub align_bits: u32,
    pub byte_order: ByteOrder,
    pub bit_reversed: bool,
}

impl FixedLengthFloatType {
    pub fn new(len_bits: u32, align_bits: u32, byte_order: ByteOrder) -> Result<Self, MetadataError> {
        if len_bits != 32 && len_bits != 64 {
            return Err(MetadataError::InvalidFloatLength(len_bits));
        }
        check_align(align_bits)?;
        Ok(Self {
            len_bits,
            align_bits,
            byte_order,
            bit_reversed: false,
        })
    }
}

/// A variable-length (LEB128) unsigned integer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VariableLengthUIntType {
    pub roles: Vec<UnsignedIntegerRole>,
}

impl VariableLengthUIntType {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role(mut self, role: UnsignedIntegerRole) -> Self {
        self.roles.push(role);
        self
    }
}

/// A variable-length (LEB128) signed integer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VariableLengthSIntType;

impl VariableLengthSIntType {
    pub fn new() -> Self {
        Self
    }
}

/// A null-terminated string; the terminator is one all-zero code unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NullTerminatedStringType {
    pub encoding: StrEncoding,
}

impl NullTerminatedStringType {
    pub fn new(encoding: StrEncoding) -> Self {
        Self { encoding }
    }
}

/// A static-length array.
#[derive(Debug, Clone, PartialEq)]
pub struct StaticLengthArrayType {
    pub len: u64,
    pub elem_type: Arc<DataType>,
    /// This array holds the 16 bytes of the metadata stream UUID
    /// (a `u8[16]` packet-header member in CTF 1.8 traces).
    pub has_metadata_stream_uuid_role: bool,
}

impl StaticLengthArrayType {
    pub fn new(len: u64, elem_type: Arc<DataType>) -> Self {
        Self {
            len,
            elem_type,
            has_metadata_stream_uuid_role: false,
        }
    }

    pub fn with_metadata_stream_uuid_role(mut self) -> Result<Self, MetadataError> {
        let byte_elems = matches!(
            self.elem_type.as_ref(),
            DataType::FixedUInt(t) if t.len_bits == 8
        );
        if self.len != 16 || !byte_elems {
            return Err(MetadataError::InvalidUuidType);
        }
        self.has_metadata_stream_uuid_role = true;
        Ok(self)
    }
}

/// A dynamic-length array; its length is read from another field.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicLengthArrayType {
    pub len_location: DataLocation,
    pub elem_type: Arc<DataType>,
}

impl DynamicLengthArrayType {
    pub fn new(len_location: DataLocation, elem_type: Arc<DataType>) -> Self {
        Self {
            len_location,
            elem_type,
        }
    }
}

/// A static-length string: a fixed number of bytes holding an encoded
/// string, possibly null-terminated early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticLengthStringType {
    pub len_bytes: u64,
    pub encoding: StrEncoding,
}

impl StaticLengthStringType {
    pub fn new(len_bytes: u64, encoding: StrEncoding) -> Self {
        Self { len_bytes, encoding }
    }
}

/// A dynamic-length string; its byte length is read from another field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicLengthStringType {
    pub len_location: DataLocation,
    pub encoding: StrEncoding,
}

impl DynamicLengthStringType {
    pub fn new(len_location: DataLocation, encoding: StrEncoding) -> Self {
        Self {
            len_location,
            encoding,
        }
    }
}

/// A static-length BLOB: a fixed number of raw bytes with a media type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticLengthBlobType {
    pub len_bytes: u64,
    pub media_type: String,
    /// This BLOB holds the 16 bytes of the metadata stream UUID.
    pub has_metadata_stream_uuid_role: bool,
}

impl StaticLengthBlobType {
    pub fn new(len_bytes: u64, media_type: impl Into<String>) -> Self {
        Self {
            len_bytes,
            media_type: media_type.into(),
            has_metadata_stream_uuid_role: false,
        }
    }

    pub fn with_metadata_stream_uuid_role(mut self) -> Result<Self, MetadataError> {
        if self.len_bytes != 16 {
            return Err(MetadataError::InvalidUuidType);
        }
        self.has_metadata_stream_uuid_role = true;
        Ok(self)
    }
}

/// A dynamic-length BLOB; its byte length is read from another field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicLengthBlobType {
    pub len_location: DataLocation,
    pub media_type: String,
}

impl DynamicLengthBlobType {
    pub fn new(len_location: DataLocation, media_type: impl Into<String>) -> Self {
        Self {
            len_location,
            media_type: media_type.into(),
        }
    }
}

/// A named member of a structure type.
#[derive(Debug, Clone, PartialEq)]
pub struct StructMemberType {
    pub name: String,
    pub data_type: Arc<DataType>,
}

impl StructMemberType {
    pub fn new(name: impl Into<String>, data_type: Arc<DataType>) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// A structure type: an ordered sequence of named members.
#[derive(Debug, Clone, PartialEq)]
pub struct StructType {
    pub min_align_bits: u32,
    pub members: Vec<Arc<StructMemberType>>,
}

impl StructType {
    pub fn new(
        min_align_bits: u32,
        members: Vec<StructMemberType>,
    ) -> Result<Self, MetadataError> {
        check_align(min_align_bits)?;
        let mut seen = HashSet::new();
        for m in &members {
            if !seen.insert(m.name.clone()) {
                return Err(MetadataError::DuplicateMemberName(m.name.clone()));
            }
        }
        Ok(Self {
            min_align_bits,
            members: members.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn member(&self, name: &str) -> Option<&Arc<StructMemberType>> {
        self.members.iter().find(|m| m.name == name)
    }
}

/// One option of a variant type.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantTypeOption<T> {
    pub name: Option<String>,
    pub ranges: IntegerRangeSet<T>,
    pub data_type: Arc<DataType>,
}

impl<T> VariantTypeOption<T> {
    pub fn new(ranges: IntegerRangeSet<T>, data_type: Arc<DataType>) -> Self {
        Self {
            name: None,
            ranges,
            data_type,
        }
    }
}

/// A variant with an unsigned integer selector.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantUIntSelType {
    pub sel_location: DataLocation,
    pub options: Vec<VariantTypeOption<u64>>,
}

impl VariantUIntSelType {
    pub fn new(
        sel_location: DataLocation,
        options: Vec<VariantTypeOption<u64>>,
    ) -> Result<Self, MetadataError> {
        if options.is_empty() {
            return Err(MetadataError::EmptyVariant);
        }
        Ok(Self {
            sel_location,
            options,
        })
    }
}

/// A variant with a signed integer selector.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantSIntSelType {
    pub sel_location: DataLocation,
    pub options: Vec<VariantTypeOption<i64>>,
}

impl VariantSIntSelType {
    pub fn new(
        sel_location: DataLocation,
        options: Vec<VariantTypeOption<i64>>,
    ) -> Result<Self, MetadataError> {
        if options.is_empty() {
            return Err(MetadataError::EmptyVariant);
        }
        Ok(Self {
            sel_location,
            options,
        })
    }
}

/// An optional with a boolean selector: its body exists when the selector
/// is true.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionalBoolSelType {
    pub sel_location: DataLocation,
    pub body_type: Arc<DataType>,
}

impl OptionalBoolSelType {
    pub fn new(sel_location: DataLocation, body_type: Arc<DataType>) -> Self {
        Self {
            sel_location,
            body_type,
        }
    }
}

/// An optional with an unsigned integer selector: its body exists when the
/// selector value falls within the range set.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionalUIntSelType {
    pub sel_location: DataLocation,
    pub ranges: IntegerRangeSet<u64>,
    pub body_type: Arc<DataType>,
}

impl OptionalUIntSelType {
    pub fn new(
        sel_location: DataLocation,
        ranges: IntegerRangeSet<u64>,
        body_type: Arc<DataType>,
    ) -> Self {
        Self {
            sel_location,
            ranges,
            body_type,
        }
    }
}

/// An optional with a signed integer selector.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionalSIntSelType {
    pub sel_location: DataLocation,
    pub ranges: IntegerRangeSet<i64>,
    pub body_type: Arc<DataType>,
}

impl OptionalSIntSelType {
    pub fn new(
        sel_location: DataLocation,
        ranges: IntegerRangeSet<i64>,
        body_type: Arc<DataType>,
    ) -> Self {
        Self {
            sel_location,
            ranges,
            body_type,
        }
    }
}

/// The closed set of data types a trace schema can describe.
#[derive(Debug, Clone, PartialEq)]
pub enum DataType {
    FixedBitArray(FixedLengthBitArrayType),
    FixedBitMap(FixedLengthBitMapType),
    FixedBool(FixedLengthBoolType),
    FixedUInt(FixedLengthUIntType),
    FixedSInt(FixedLengthSIntType),
    FixedFloat(FixedLengthFloatType),
    VarUInt(VariableLengthUIntType),
    VarSInt(VariableLengthSIntType),
    NullTermStr(NullTerminatedStringType),
    StaticArray(StaticLengthArrayType),
    DynArray(DynamicLengthArrayType),
    StaticStr(StaticLengthStringType),
    DynStr(DynamicLengthStringType),
    StaticBlob(StaticLengthBlobType),
    DynBlob(DynamicLengthBlobType),
    Struct(StructType),
    VariantUIntSel(VariantUIntSelType),
    VariantSIntSel(VariantSIntSelType),
    OptionalBoolSel(OptionalBoolSelType),
    OptionalUIntSel(OptionalUIntSelType),
    OptionalSIntSel(OptionalSIntSelType),
}

impl DataType {
    /// Alignment of the first bit of an instance of this type, in bits.
    pub fn alignment_bits(&self) -> u32 {
        match self {
            DataType::FixedBitArray(t) => t.align_bits,
            DataType::FixedBitMap(t) => t.align_bits,
            DataType::FixedBool(t) => t.align_bits,
            DataType::FixedUInt(t) => t.align_bits,
            DataType::FixedSInt(t) => t.align_bits,
            DataType::FixedFloat(t) => t.align_bits,
            DataType::VarUInt(_) | DataType::VarSInt(_) => 8,
            DataType::NullTermStr(_)
            | DataType::StaticStr(_)
            | DataType::DynStr(_)
            | DataType::StaticBlob(_)
            | DataType::DynBlob(_) => 8,
            DataType::StaticArray(t) => t.elem_type.alignment_bits(),
            DataType::DynArray(t) => t.elem_type.alignment_bits(),
            DataType::Struct(t) => t
                .members
                .iter()
                .map(|m| m.data_type.alignment_bits())
                .fold(t.min_align_bits, u32::max),
            // The chosen body aligns itself when its read begins.
            DataType::VariantUIntSel(_)
            | DataType::VariantSIntSel(_)
            | DataType::OptionalBoolSel(_)
            | DataType::OptionalUIntSel(_)
            | DataType::OptionalSIntSel(_) => 1,
        }
    }

    pub fn as_struct(&self) -> Option<&StructType> {
        match self {
            DataType::Struct(t) => Some(t),
            _ => None,
        }
    }
}

macro_rules! impl_from_data_type {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(impl From<$ty> for DataType {
            fn from(t: $ty) -> Self {
                DataType::$variant(t)
            }
        })*
    };
}

impl_from_data_type! {
    FixedBitArray => FixedLengthBitArrayType,
    FixedBitMap => FixedLengthBitMapType,
    FixedBool => FixedLengthBoolType,
    FixedUInt => FixedLengthUIntType,
    FixedSInt => FixedLengthSIntType,
    FixedFloat => FixedLengthFloatType,
    VarUInt => VariableLengthUIntType,
    VarSInt => VariableLengthSIntType,
    NullTermStr => NullTerminatedStringType,
    StaticArray => StaticLengthArrayType,
    DynArray => DynamicLengthArrayType,
    StaticStr => StaticLengthStringType,
    DynStr => DynamicLengthStringType,
    StaticBlob => StaticLengthBlobType,
    DynBlob => DynamicLengthBlobType,
    Struct => StructType,
    VariantUIntSel => VariantUIntSelType,
    VariantSIntSel => VariantSIntSelType,
    OptionalBoolSel => OptionalBoolSelType,
    OptionalUIntSel => OptionalUIntSelType,
    OptionalSIntSel => OptionalSIntSelType,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn length_bounds() {
        assert_matches!(
            FixedLengthUIntType::new(0, 8, ByteOrder::LittleEndian),
            Err(MetadataError::InvalidLength(0))
        );
        assert_matches!(
            FixedLengthUIntType::new(65, 8, ByteOrder::LittleEndian),
            Err(MetadataError::InvalidLength(65))
        );
        assert!(FixedLengthUIntType::new(64, 8, ByteOrder::LittleEndian).is_ok());
    }

    #[test]
    fn alignment_must_be_power_of_two() {
        assert_matches!(
            FixedLengthUIntType::new(8, 3, ByteOrder::LittleEndian),
            Err(MetadataError::InvalidAlignment(3))
        );
    }

    #[test]
    fn float_lengths() {
        assert!(FixedLengthFloatType::new(32, 32, ByteOrder::LittleEndian).is_ok());
        assert!(FixedLengthFloatType::new(64, 64, ByteOrder::BigEndian).is_ok());
        assert_matches!(
            FixedLengthFloatType::new(16, 8, ByteOrder::LittleEndian),
            Err(MetadataError::InvalidFloatLength(16))
        );
    }

    #[test]
    fn struct_alignment_is_max_of_members() {
        let st = StructType::new(
            8,
            vec![
                StructMemberType::new(
                    "a",
                    Arc::new(FixedLengthUIntType::new(8, 8, ByteOrder::LittleEndian).unwrap().into()),
                ),
                StructMemberType::new(
                    "b",
                    Arc::new(FixedLengthUIntType::new(32, 32, ByteOrder::LittleEndian).unwrap().into()),
                ),
            ],
        )
        .unwrap();
        assert_eq!(DataType::Struct(st).alignment_bits(), 32);
    }

    #[test]
    fn duplicate_members_rejected() {
        let dup = StructType::new(
            1,
            vec![
                StructMemberType::new(
                    "x",
                    Arc::new(FixedLengthUIntType::new(8, 8, ByteOrder::LittleEndian).unwrap().into()),
                ),
                StructMemberType::new(
                    "x",
                    Arc::new(FixedLengthUIntType::new(8, 8, ByteOrder::LittleEndian).unwrap().into()),
                ),
            ],
        );
        assert_matches!(dup, Err(MetadataError::DuplicateMemberName(name)) if name == "x");
    }

    #[test]
    fn uuid_array_role_requires_16_bytes() {
        let u8_type: Arc<DataType> =
            Arc::new(FixedLengthUIntType::new(8, 8, ByteOrder::LittleEndian).unwrap().into());
        assert!(StaticLengthArrayType::new(16, u8_type.clone())
            .with_metadata_stream_uuid_role()
            .is_ok());
        assert_matches!(
            StaticLengthArrayType::new(8, u8_type).with_metadata_stream_uuid_role(),
            Err(MetadataError::InvalidUuidType)
        );
    }
}
