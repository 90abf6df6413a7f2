//! Elements: the units of output of an element sequence iterator.
//!
//! The iterator yields one [`Element`] per advance: a structural marker
//! (begin/end), a decoded value, or stream metadata. The element borrows
//! from the decoder and is valid until the next advance; callers copy what
//! they need to keep.

use std::sync::Arc;

use ctfstream_metadata::{DataStreamType, DataType, EventRecordType, Scope, StructMemberType, Uuid};

use crate::proc::ReadData;

/// Expected magic number of the first packet-header field carrying the
/// packet-magic-number role.
pub const PACKET_MAGIC_NUMBER: u64 = 0xC1FC_1FC1;

/// Data-type and member attribution of a decoded element (owned storage).
#[derive(Debug, Clone)]
pub(crate) struct DataRef {
    pub data_type: Arc<DataType>,
    pub member: Option<Arc<StructMemberType>>,
}

impl From<&ReadData> for DataRef {
    fn from(data: &ReadData) -> Self {
        Self {
            data_type: Arc::clone(&data.data_type),
            member: data.member.clone(),
        }
    }
}

/// Packet information accumulated while decoding the packet preambles.
#[derive(Debug, Clone, Default)]
pub(crate) struct PktInfoData {
    pub expected_total_len_bits: Option<u64>,
    pub expected_content_len_bits: Option<u64>,
    pub seq_num: Option<u64>,
    pub disc_er_counter_snap: Option<u64>,
    pub end_def_clk_val: Option<u64>,
}

/// Data stream information accumulated while decoding the packet header.
#[derive(Debug, Clone, Default)]
pub(crate) struct DsInfoData {
    pub dst: Option<Arc<DataStreamType>>,
    pub ds_id: Option<u64>,
}

/// Event record information for the current event record.
#[derive(Debug, Clone, Default)]
pub(crate) struct ErInfoData {
    pub ert: Option<Arc<EventRecordType>>,
}

/// The current element, stored inline within the VM position.
///
/// Substring and BLOB-section payloads are byte ranges into the position's
/// data window; [`view`] resolves them to slices.
#[derive(Debug, Clone)]
pub(crate) enum ElemData {
    PktBegin,
    PktContentBegin,
    PktContentEnd,
    PktEnd,
    ScopeBegin(Scope),
    ScopeEnd(Scope),
    ErBegin,
    ErEnd,
    PktMagicNumber { val: u64 },
    MetadataStreamUuid { uuid: Uuid },
    DsInfo(DsInfoData),
    PktInfo(PktInfoData),
    ErInfo(ErInfoData),
    DefClkVal { cycles: u64 },
    FlBitArray { r: DataRef, val: u64 },
    FlBitMap { r: DataRef, val: u64 },
    FlBool { r: DataRef, val: bool },
    FlUInt { r: DataRef, val: u64 },
    FlSInt { r: DataRef, val: i64 },
    FlFloat { r: DataRef, val: f64 },
    VlUInt { r: DataRef, val: u64, len_bytes: u32 },
    VlSInt { r: DataRef, val: i64, len_bytes: u32 },
    NtStrBegin { r: DataRef },
    Substring { begin: usize, end: usize },
    StrEnd,
    StaticArrayBegin { r: DataRef, len: u64 },
    StaticArrayEnd,
    DynArrayBegin { r: DataRef, len: u64 },
    DynArrayEnd,
    StaticStrBegin { r: DataRef, len_bytes: u64 },
    DynStrBegin { r: DataRef, len_bytes: u64 },
    StaticBlobBegin { r: DataRef, len_bytes: u64 },
    DynBlobBegin { r: DataRef, len_bytes: u64 },
    BlobSection { begin: usize, end: usize },
    BlobEnd,
    StructBegin { r: DataRef },
    StructEnd,
    VarUIntSelBegin { r: DataRef, sel: u64 },
    VarSIntSelBegin { r: DataRef, sel: i64 },
    VarEnd,
    OptBegin { r: DataRef, enabled: bool },
    OptEnd,
}

/// One element of an element sequence.
///
/// Borrowed from the iterator; valid until the next advance.
#[derive(Debug, Clone)]
pub enum Element<'a> {
    PacketBeginning,
    PacketContentBeginning,
    PacketContentEnd,
    PacketEnd,
    ScopeBeginning { scope: Scope },
    ScopeEnd { scope: Scope },
    EventRecordBeginning,
    EventRecordEnd,
    /// Decoded packet magic number; compare with [`PACKET_MAGIC_NUMBER`].
    PacketMagicNumber { value: u64 },
    MetadataStreamUuid { uuid: Uuid },
    DataStreamInfo {
        data_stream_type: Option<&'a Arc<DataStreamType>>,
        data_stream_id: Option<u64>,
    },
    PacketInfo {
        expected_total_len_bits: Option<u64>,
        expected_content_len_bits: Option<u64>,
        sequence_number: Option<u64>,
        discarded_event_record_counter: Option<u64>,
        end_default_clock_value: Option<u64>,
    },
    EventRecordInfo {
        event_record_type: Option<&'a Arc<EventRecordType>>,
    },
    /// Current default clock value, in cycles.
    DefaultClockValue { cycles: u64 },
    FixedLengthBitArray {
        data_type: &'a Arc<DataType>,
        member: Option<&'a str>,
        value: u64,
    },
    FixedLengthBitMap {
        data_type: &'a Arc<DataType>,
        member: Option<&'a str>,
        value: u64,
    },
    FixedLengthBoolean {
        data_type: &'a Arc<DataType>,
        member: Option<&'a str>,
        value: bool,
    },
    UnsignedInt {
        data_type: &'a Arc<DataType>,
        member: Option<&'a str>,
        value: u64,
    },
    SignedInt {
        data_type: &'a Arc<DataType>,
        member: Option<&'a str>,
        value: i64,
    },
    Float {
        data_type: &'a Arc<DataType>,
        member: Option<&'a str>,
        value: f64,
    },
    VariableLengthUnsignedInt {
        data_type: &'a Arc<DataType>,
        member: Option<&'a str>,
        value: u64,
        len_bytes: u32,
    },
    VariableLengthSignedInt {
        data_type: &'a Arc<DataType>,
        member: Option<&'a str>,
        value: i64,
        len_bytes: u32,
    },
    NullTerminatedStringBeginning {
        data_type: &'a Arc<DataType>,
        member: Option<&'a str>,
    },
    /// A chunk of string bytes. A string may span several substrings when
    /// it crosses data windows; a null terminator, when present, ends the
    /// final substring.
    Substring { bytes: &'a [u8] },
    StringEnd,
    StaticArrayBeginning {
        data_type: &'a Arc<DataType>,
        member: Option<&'a str>,
        len: u64,
    },
    StaticArrayEnd,
    DynamicArrayBeginning {
        data_type: &'a Arc<DataType>,
        member: Option<&'a str>,
        len: u64,
    },
    DynamicArrayEnd,
    StaticStringBeginning {
        data_type: &'a Arc<DataType>,
        member: Option<&'a str>,
        len_bytes: u64,
    },
    DynamicStringBeginning {
        data_type: &'a Arc<DataType>,
        member: Option<&'a str>,
        len_bytes: u64,
    },
    StaticBlobBeginning {
        data_type: &'a Arc<DataType>,
        member: Option<&'a str>,
        len_bytes: u64,
    },
    DynamicBlobBeginning {
        data_type: &'a Arc<DataType>,
        member: Option<&'a str>,
        len_bytes: u64,
    },
    /// A chunk of BLOB bytes.
    BlobSection { bytes: &'a [u8] },
    BlobEnd,
    StructureBeginning {
        data_type: &'a Arc<DataType>,
        member: Option<&'a str>,
    },
    StructureEnd,
    VariantWithUnsignedSelectorBeginning {
        data_type: &'a Arc<DataType>,
        member: Option<&'a str>,
        selector: u64,
    },
    VariantWithSignedSelectorBeginning {
        data_type: &'a Arc<DataType>,
        member: Option<&'a str>,
        selector: i64,
    },
    VariantEnd,
    OptionalBeginning {
        data_type: &'a Arc<DataType>,
        member: Option<&'a str>,
        enabled: bool,
    },
    OptionalEnd,
}

fn member_name(r: &DataRef) -> Option<&str> {
    r.member.as_ref().map(|m| m.name.as_str())
}

/// Resolve the owned element storage to a borrowed element view.
pub(crate) fn view<'a>(elem: &'a ElemData, window: &'a [u8]) -> Element<'a> {
    match elem {
        ElemData::PktBegin => Element::PacketBeginning,
        ElemData::PktContentBegin => Element::PacketContentBeginning,
        ElemData::PktContentEnd => Element::PacketContentEnd,
        ElemData::PktEnd => Element::PacketEnd,
        ElemData::ScopeBegin(scope) => Element::ScopeBeginning { scope: *scope },
        ElemData::ScopeEnd(scope) => Element::ScopeEnd { scope: *scope },
        ElemData::ErBegin => Element::EventRecordBeginning,
        ElemData::ErEnd => Element::EventRecordEnd,
        ElemData::PktMagicNumber { val } => Element::PacketMagicNumber { value: *val },
        ElemData::MetadataStreamUuid { uuid } => Element::MetadataStreamUuid { uuid: *uuid },
        ElemData::DsInfo(info) => Element::DataStreamInfo {
            data_stream_type: info.dst.as_ref(),
            data_stream_id: info.ds_id,
        },
        ElemData::PktInfo(info) => Element::PacketInfo {
            expected_total_len_bits: info.expected_total_len_bits,
            expected_content_len_bits: info.expected_content_len_bits,
            sequence_number: info.seq_num,
            discarded_event_record_counter: info.disc_er_counter_snap,
            end_default_clock_value: info.end_def_clk_val,
        },
        ElemData::ErInfo(info) => Element::EventRecordInfo {
            event_record_type: info.ert.as_ref(),
        },
        ElemData::DefClkVal { cycles } => Element::DefaultClockValue { cycles: *cycles },
        ElemData::FlBitArray { r, val } => Element::FixedLengthBitArray {
            data_type: &r.data_type,
            member: member_name(r),
            value: *val,
        },
        ElemData::FlBitMap { r, val } => Element::FixedLengthBitMap {
            data_type: &r.data_type,
            member: member_name(r),
            value: *val,
        },
        ElemData::FlBool { r, val } => Element::FixedLengthBoolean {
            data_type: &r.data_type,
            member: member_name(r),
            value: *val,
        },
        ElemData::FlUInt { r, val } => Element::UnsignedInt {
            data_type: &r.data_type,
            member: member_name(r),
            value: *val,
        },
        ElemData::FlSInt { r, val } => Element::SignedInt {
            data_type: &r.data_type,
            member: member_name(r),
            value: *val,
        },
        ElemData::FlFloat { r, val } => Element::Float {
            data_type: &r.data_type,
            member: member_name(r),
            value: *val,
        },
        ElemData::VlUInt { r, val, len_bytes } => Element::VariableLengthUnsignedInt {
            data_type: &r.data_type,
            member: member_name(r),
            value: *val,
            len_bytes: *len_bytes,
        },
        ElemData::VlSInt { r, val, len_bytes } => Element::VariableLengthSignedInt {
            data_type: &r.data_type,
            member: member_name(r),
            value: *val,
            len_bytes: *len_bytes,
        },
        ElemData::NtStrBegin { r } => Element::NullTerminatedStringBeginning {
            data_type: &r.data_type,
            member: member_name(r),
        },
        ElemData::Substring { begin, end } => Element::Substring {
            bytes: &window[*begin..*end],
        },
        ElemData::StrEnd => Element::StringEnd,
        ElemData::StaticArrayBegin { r, len } => Element::StaticArrayBeginning {
            data_type: &r.data_type,
            member: member_name(r),
            len: *len,
        },
        ElemData::StaticArrayEnd => Element::StaticArrayEnd,
        ElemData::DynArrayBegin { r, len } => Element::DynamicArrayBeginning {
            data_type: &r.data_type,
            member: member_name(r),
            len: *len,
        },
        ElemData::DynArrayEnd => Element::DynamicArrayEnd,
        ElemData::StaticStrBegin { r, len_bytes } => Element::StaticStringBeginning {
            data_type: &r.data_type,
            member: member_name(r),
            len_bytes: *len_bytes,
        },
        ElemData::DynStrBegin { r, len_bytes } => Element::DynamicStringBeginning {
            data_type: &r.data_type,
            member: member_name(r),
            len_bytes: *len_bytes,
        },
        ElemData::StaticBlobBegin { r, len_bytes } => Element::StaticBlobBeginning {
            data_type: &r.data_type,
            member: member_name(r),
            len_bytes: *len_bytes,
        },
        ElemData::DynBlobBegin { r, len_bytes } => Element::DynamicBlobBeginning {
            data_type: &r.data_type,
            member: member_name(r),
            len_bytes: *len_bytes,
        },
        ElemData::BlobSection { begin, end } => Element::BlobSection {
            bytes: &window[*begin..*end],
        },
        ElemData::BlobEnd => Element::BlobEnd,
        ElemData::StructBegin { r } => Element::StructureBeginning {
            data_type: &r.data_type,
            member: member_name(r),
        },
        ElemData::StructEnd => Element::StructureEnd,
        ElemData::VarUIntSelBegin { r, sel } => Element::VariantWithUnsignedSelectorBeginning {
            data_type: &r.data_type,
            member: member_name(r),
            selector: *sel,
        },
        ElemData::VarSIntSelBegin { r, sel } => Element::VariantWithSignedSelectorBeginning {
            data_type: &r.data_type,
            member: member_name(r),
            selector: *sel,
        },
        ElemData::VarEnd => Element::VariantEnd,
        ElemData::OptBegin { r, enabled } => Element::OptionalBeginning {
            data_type: &r.data_type,
            member: member_name(r),
            enabled: *enabled,
        },
        ElemData::OptEnd => Element::OptionalEnd,
    }
}
