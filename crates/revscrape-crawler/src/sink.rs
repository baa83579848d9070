use crate::record::Record;

/// Append-only destination of extracted records.
///
/// Implementations must leave previously appended records intact when an append fails,
/// and a successful append must be flushed before it returns.
pub trait RecordSink: Send {
    fn append(&mut self, records: &[Record]) -> anyhow::Result<()>;
}

impl<S> RecordSink for Box<S>
where
    S: RecordSink + ?Sized,
{
    fn append(&mut self, records: &[Record]) -> anyhow::Result<()> {
        (**self).append(records)
    }
}

/// Keeps every appended batch in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub batches: Vec<Vec<Record>>,
}

impl MemorySink {
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.batches.iter().flatten()
    }
}

impl RecordSink for MemorySink {
    fn append(&mut self, records: &[Record]) -> anyhow::Result<()> {
        self.batches.push(records.to_vec());
        Ok(())
    }
}
