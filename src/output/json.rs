use std::io::Write;

use crate::error::WatchError;
use crate::output::RecordSink;
use crate::record::Record;

/// Newline-delimited JSON sink: one record per line.
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write + Send> RecordSink for JsonLinesSink<W> {
    fn publish(&mut self, record: &Record) -> Result<(), WatchError> {
        serde_json::to_writer(&mut self.writer, record)
            .map_err(|e| WatchError::Serialization(std::io::Error::other(e.to_string())))?;
        writeln!(self.writer).map_err(WatchError::Serialization)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), WatchError> {
        self.writer.flush().map_err(WatchError::Serialization)
    }
}
