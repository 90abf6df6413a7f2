//! Data sources: where element sequences get their bytes.

use std::sync::Arc;

/// Creates data sources over one underlying byte sequence.
///
/// The factory is shared by every iterator of an element sequence and is
/// the only object that must tolerate use from several iterators; each
/// iterator gets its own exclusive [`DataSource`].
pub trait DataSourceFactory {
    fn create_data_source(&self) -> Box<dyn DataSource>;
}

/// An exclusive handle supplying blocks of trace bytes.
pub trait DataSource {
    /// A block of bytes starting at `byte_offset` within the sequence.
    ///
    /// Returns at least `min_bytes` bytes when that much data exists, and
    /// always at least one byte; the borrow is valid until the next call on
    /// the same source. `None` signals the end of the sequence at
    /// `byte_offset`. This is the only operation that may block.
    fn data(&mut self, byte_offset: u64, min_bytes: usize) -> Option<&[u8]>;
}

/// In-memory data source factory over a byte buffer.
///
/// `max_block_bytes` caps the size of returned blocks (still honouring the
/// requested minimum), which makes window-boundary paths easy to exercise.
pub struct SliceDataSourceFactory {
    bytes: Arc<[u8]>,
    max_block_bytes: Option<usize>,
}

impl SliceDataSourceFactory {
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
            max_block_bytes: None,
        }
    }

    pub fn with_max_block_bytes(mut self, max_block_bytes: usize) -> Self {
        self.max_block_bytes = Some(max_block_bytes.max(1));
        self
    }
}

impl DataSourceFactory for SliceDataSourceFactory {
    fn create_data_source(&self) -> Box<dyn DataSource> {
        Box::new(SliceDataSource {
            bytes: Arc::clone(&self.bytes),
            max_block_bytes: self.max_block_bytes,
        })
    }
}

struct SliceDataSource {
    bytes: Arc<[u8]>,
    max_block_bytes: Option<usize>,
}

impl DataSource for SliceDataSource {
    fn data(&mut self, byte_offset: u64, min_bytes: usize) -> Option<&[u8]> {
        let len = self.bytes.len() as u64;
        if byte_offset >= len {
            return None;
        }
        let begin = byte_offset as usize;
        let mut end = self.bytes.len();
        if let Some(max) = self.max_block_bytes {
            end = end.min(begin + max.max(min_bytes));
        }
        Some(&self.bytes[begin..end])
    }
}
