pub mod json;

use crate::error::WatchError;
use crate::record::Record;

/// Destination for finished records. The publisher thread drains the record
/// queue into one of these; a failed publish is logged and the record is
/// dropped.
pub trait RecordSink: Send {
    fn publish(&mut self, record: &Record) -> Result<(), WatchError>;

    /// Flush buffered output. Called on shutdown.
    fn flush(&mut self) -> Result<(), WatchError> {
        Ok(())
    }
}
