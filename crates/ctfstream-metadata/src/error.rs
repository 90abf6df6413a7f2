/// Errors raised while constructing trace-type objects.
///
/// These are schema-validation failures: they surface when the model is
/// built, never while decoding data.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("invalid bit-array length {0}: must be within 1..=64")]
    InvalidLength(u32),

    #[error("invalid floating point number length {0}: must be 32 or 64")]
    InvalidFloatLength(u32),

    #[error("invalid alignment {0}: must be a power of two")]
    InvalidAlignment(u32),

    #[error("duplicate member name `{0}` in structure type")]
    DuplicateMemberName(String),

    #[error("duplicate type id {0}")]
    DuplicateTypeId(u64),

    #[error("variant type has no options")]
    EmptyVariant,

    #[error("data location has an empty path")]
    EmptyDataLocationPath,

    #[error("{0} scope type must be a structure type")]
    NotAStructure(&'static str),

    #[error("metadata stream UUID type must cover exactly 16 bytes")]
    InvalidUuidType,

    #[error("clock type frequency must be greater than zero")]
    InvalidClockFrequency,
}
