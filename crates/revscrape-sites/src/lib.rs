mod presets;
pub mod writer;

pub use presets::{booking, preset, tripadvisor, Preset, PRESETS};
pub use writer::{CsvSink, CsvWriterConfig};

pub use anyhow;
