use std::collections::HashMap;
use std::sync::Arc;

use crate::{ClockType, DataType, MetadataError, Uuid};

fn check_scope(
    what: &'static str,
    dt: &Option<Arc<DataType>>,
) -> Result<(), MetadataError> {
    match dt {
        Some(dt) if dt.as_struct().is_none() => Err(MetadataError::NotAStructure(what)),
        _ => Ok(()),
    }
}

/// An event record type: the shape of one class of event record within a
/// data stream.
#[derive(Debug, Clone)]
pub struct EventRecordType {
    pub id: u64,
    pub name: Option<String>,
    /// Specific-context scope; must be a structure type.
    pub specific_context: Option<Arc<DataType>>,
    /// Payload scope; must be a structure type.
    pub payload: Option<Arc<DataType>>,
}

impl EventRecordType {
    pub fn new(
        id: u64,
        name: Option<String>,
        specific_context: Option<Arc<DataType>>,
        payload: Option<Arc<DataType>>,
    ) -> Result<Self, MetadataError> {
        check_scope("event-record-specific-context", &specific_context)?;
        check_scope("event-record-payload", &payload)?;
        Ok(Self {
            id,
            name,
            specific_context,
            payload,
        })
    }
}

/// A data stream type: the shape of every packet of one class of data
/// stream, with its set of event record types.
#[derive(Debug, Clone)]
pub struct DataStreamType {
    pub id: u64,
    pub name: Option<String>,
    /// Packet-context scope; must be a structure type.
    pub packet_context: Option<Arc<DataType>>,
    /// Event-record-header scope; must be a structure type.
    pub event_record_header: Option<Arc<DataType>>,
    /// Event-record-common-context scope; must be a structure type.
    pub event_record_common_context: Option<Arc<DataType>>,
    pub default_clock_type: Option<Arc<ClockType>>,
    event_record_types: Vec<Arc<EventRecordType>>,
    ert_ids: HashMap<u64, usize>,
}

impl DataStreamType {
    pub fn new(
        id: u64,
        packet_context: Option<Arc<DataType>>,
        event_record_header: Option<Arc<DataType>>,
        event_record_common_context: Option<Arc<DataType>>,
        default_clock_type: Option<Arc<ClockType>>,
        event_record_types: Vec<EventRecordType>,
    ) -> Result<Self, MetadataError> {
        check_scope("packet-context", &packet_context)?;
        check_scope("event-record-header", &event_record_header)?;
        check_scope("event-record-common-context", &event_record_common_context)?;

        let mut ert_ids = HashMap::new();
        for (i, ert) in event_record_types.iter().enumerate() {
            if ert_ids.insert(ert.id, i).is_some() {
                return Err(MetadataError::DuplicateTypeId(ert.id));
            }
        }
        Ok(Self {
            id,
            name: None,
            packet_context,
            event_record_header,
            event_record_common_context,
            default_clock_type,
            event_record_types: event_record_types.into_iter().map(Arc::new).collect(),
            ert_ids,
        })
    }

    pub fn event_record_types(&self) -> &[Arc<EventRecordType>] {
        &self.event_record_types
    }

    pub fn event_record_type(&self, id: u64) -> Option<&Arc<EventRecordType>> {
        self.ert_ids.get(&id).map(|i| &self.event_record_types[*i])
    }
}

/// A trace type: the root of the metadata model.
///
/// A trace type is frozen once built and outlives every decoder created
/// from it.
#[derive(Debug, Clone)]
pub struct TraceType {
    pub major_version: u32,
    pub minor_version: u32,
    pub uuid: Option<Uuid>,
    /// Packet-header scope; must be a structure type.
    pub packet_header: Option<Arc<DataType>>,
    pub clock_types: Vec<Arc<ClockType>>,
    data_stream_types: Vec<Arc<DataStreamType>>,
    dst_ids: HashMap<u64, usize>,
}

impl TraceType {
    pub fn new(
        major_version: u32,
        minor_version: u32,
        uuid: Option<Uuid>,
        packet_header: Option<Arc<DataType>>,
        clock_types: Vec<ClockType>,
        data_stream_types: Vec<DataStreamType>,
    ) -> Result<Self, MetadataError> {
        check_scope("packet-header", &packet_header)?;

        let mut dst_ids = HashMap::new();
        for (i, dst) in data_stream_types.iter().enumerate() {
            if dst_ids.insert(dst.id, i).is_some() {
                return Err(MetadataError::DuplicateTypeId(dst.id));
            }
        }
        Ok(Self {
            major_version,
            minor_version,
            uuid,
            packet_header,
            clock_types: clock_types.into_iter().map(Arc::new).collect(),
            data_stream_types: data_stream_types.into_iter().map(Arc::new).collect(),
            dst_ids,
        })
    }

    pub fn data_stream_types(&self) -> &[Arc<DataStreamType>] {
        &self.data_stream_types
    }

    pub fn data_stream_type(&self, id: u64) -> Option<&Arc<DataStreamType>> {
        self.dst_ids.get(&id).map(|i| &self.data_stream_types[*i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ByteOrder, FixedLengthUIntType, StructMemberType, StructType};
    use assert_matches::assert_matches;

    fn u8_struct() -> Arc<DataType> {
        let st = StructType::new(
            1,
            vec![StructMemberType::new(
                "x",
                Arc::new(FixedLengthUIntType::new(8, 8, ByteOrder::LittleEndian).unwrap().into()),
            )],
        )
        .unwrap();
        Arc::new(st.into())
    }

    #[test]
    fn scope_must_be_struct() {
        let not_struct: Arc<DataType> =
            Arc::new(FixedLengthUIntType::new(8, 8, ByteOrder::LittleEndian).unwrap().into());
        assert_matches!(
            TraceType::new(1, 8, None, Some(not_struct), vec![], vec![]),
            Err(MetadataError::NotAStructure(_))
        );
    }

    #[test]
    fn duplicate_dst_ids_rejected() {
        let dst = |id| {
            DataStreamType::new(id, Some(u8_struct()), None, None, None, vec![]).unwrap()
        };
        assert_matches!(
            TraceType::new(1, 8, None, None, vec![], vec![dst(1), dst(1)]),
            Err(MetadataError::DuplicateTypeId(1))
        );
    }

    #[test]
    fn ert_lookup_by_id() {
        let ert = EventRecordType::new(7, None, None, Some(u8_struct())).unwrap();
        let dst = DataStreamType::new(0, None, None, None, None, vec![ert]).unwrap();
        assert!(dst.event_record_type(7).is_some());
        assert!(dst.event_record_type(8).is_none());
    }
}
