use crate::error::Result;
use serde::Serialize;
use std::io::Write;

/// One result row per executed command.
#[derive(Debug, Serialize, PartialEq, Clone, Default)]
pub struct Outcome {
    pub op: String,
    pub key: String,
    pub transaction: String,
    pub group: String,
    pub status: String,
    pub amount: String,
    pub response_code: String,
    pub payment_method: String,
    pub method_status: String,
    pub error: String,
}

/// Writes outcomes as CSV with a header row.
pub struct OutcomeWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> OutcomeWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write(&mut self, outcome: &Outcome) -> Result<()> {
        self.writer.serialize(outcome)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
