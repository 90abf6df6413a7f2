use crate::{MetadataError, Uuid};

/// A clock type: the class of clocks that stamp event records of the data
/// streams referencing it.
///
/// The decoder only ever exposes clock values in cycles; converting cycles
/// to wall time is the caller's concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockType {
    pub id: String,
    pub frequency: u64,
    pub description: Option<String>,
    pub uuid: Option<Uuid>,
}

impl ClockType {
    pub fn new(id: impl Into<String>, frequency: u64) -> Result<Self, MetadataError> {
        if frequency == 0 {
            return Err(MetadataError::InvalidClockFrequency);
        }
        Ok(Self {
            id: id.into(),
            frequency,
            description: None,
            uuid: None,
        })
    }
}
