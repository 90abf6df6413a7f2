use std::fmt;

use crate::MetadataError;

/// One of the six root scopes a data location can start from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    PacketHeader,
    PacketContext,
    EventRecordHeader,
    EventRecordCommonContext,
    EventRecordSpecificContext,
    EventRecordPayload,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Scope::PacketHeader => "packet-header",
            Scope::PacketContext => "packet-context",
            Scope::EventRecordHeader => "event-record-header",
            Scope::EventRecordCommonContext => "event-record-common-context",
            Scope::EventRecordSpecificContext => "event-record-specific-context",
            Scope::EventRecordPayload => "event-record-payload",
        };
        f.write_str(name)
    }
}

/// An absolute data location: a root scope plus member names leading to a
/// leaf field.
///
/// Dynamic-length and variant/optional types use data locations to name the
/// field holding their length or selector. The referenced field must be
/// decoded before the referring one; the procedure builder enforces this.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataLocation {
    scope: Scope,
    path: Vec<String>,
}

impl DataLocation {
    pub fn new(scope: Scope, path: Vec<String>) -> Result<Self, MetadataError> {
        if path.is_empty() {
            return Err(MetadataError::EmptyDataLocationPath);
        }
        Ok(Self { scope, path })
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }
}

impl fmt::Display for DataLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.scope)?;
        for part in &self.path {
            write!(f, ".{part}")?;
        }
        Ok(())
    }
}
