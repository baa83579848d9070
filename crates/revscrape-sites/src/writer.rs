use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use revscrape_crawler::{Record, RecordSink};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CsvWriterConfig {
    #[serde(default = "default_csv_delimiter")]
    pub delimiter: char,
    #[serde(default)]
    pub escape: Option<char>,
    #[serde(default = "default_csv_terminator")]
    pub terminator: CsvTerminator,
    /// Cell written for absent fields
    #[serde(default)]
    pub absent: String,
    /// Sync file data to disk after every batch
    #[serde(default)]
    pub sync: bool,
}

impl Default for CsvWriterConfig {
    fn default() -> Self {
        Self {
            delimiter: ',',
            escape: None,
            terminator: CsvTerminator::Any('\n'),
            absent: String::new(),
            sync: false,
        }
    }
}

fn default_csv_delimiter() -> char {
    CsvWriterConfig::default().delimiter
}

fn default_csv_terminator() -> CsvTerminator {
    CsvWriterConfig::default().terminator
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum CsvTerminator {
    CRLF,
    Any(char),
}

impl From<CsvTerminator> for csv::Terminator {
    fn from(source: CsvTerminator) -> Self {
        match source {
            CsvTerminator::CRLF => Self::CRLF,
            CsvTerminator::Any(c) => Self::Any(c as u8),
        }
    }
}

impl From<&CsvWriterConfig> for csv::WriterBuilder {
    fn from(c: &CsvWriterConfig) -> Self {
        let mut builder = csv::WriterBuilder::new();
        builder.delimiter(c.delimiter as u8);
        builder.terminator(c.terminator.into());
        if let Some(escape) = c.escape {
            builder.double_quote(false);
            builder.escape(escape as u8);
        } else {
            builder.double_quote(true);
        }
        builder
    }
}

enum Target {
    File { file: fs_err::File, sync: bool },
    Stdout(io::Stdout),
}

/// Append-only CSV [`RecordSink`].
///
/// Every batch is serialized in memory and written at once. If that write fails the file
/// is truncated back to its previous length, so rows already written are never followed
/// by a partial one.
pub struct CsvSink {
    target: Target,
    config: CsvWriterConfig,
}

impl CsvSink {
    /// Opens `path` for appending, the header is written only if the file is new or empty.
    pub fn create<P: AsRef<Path>>(
        path: P,
        columns: &[String],
        config: &CsvWriterConfig,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut file = fs_err::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;

        if file.metadata()?.len() == 0 {
            let header = serialize(config, [columns])?;
            file.write_all(&header)?;
            file.flush()?;
            log::info!("Initialized {} with header {columns:?}", path.display());
        } else {
            check_header(path, columns, config)?;
            log::info!("Appending to existing {}", path.display());
        }

        Ok(Self {
            target: Target::File {
                file,
                sync: config.sync,
            },
            config: config.clone(),
        })
    }

    /// Writes the header right away, then records as they come.
    pub fn stdout(columns: &[String], config: &CsvWriterConfig) -> anyhow::Result<Self> {
        let mut stdout = io::stdout();
        stdout.write_all(&serialize(config, [columns])?)?;
        stdout.flush()?;
        Ok(Self {
            target: Target::Stdout(stdout),
            config: config.clone(),
        })
    }

    /// `output` itself for a single listing, `output` suffixed with `-{n}` (1-based)
    /// otherwise.
    pub fn numbered_path(output: &Path, n: usize, total: usize) -> PathBuf {
        if total <= 1 {
            return output.to_path_buf();
        }
        let stem = output
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = match output.extension() {
            Some(ext) => format!("{stem}-{n}.{}", ext.to_string_lossy()),
            None => format!("{stem}-{n}"),
        };
        output.with_file_name(name)
    }
}

impl RecordSink for CsvSink {
    fn append(&mut self, records: &[Record]) -> anyhow::Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let rows = records.iter().map(|r| r.to_row(&self.config.absent));
        let buf = serialize(&self.config, rows)?;

        match &mut self.target {
            Target::File { file, sync } => {
                let len = file.metadata()?.len();
                if let Err(e) = file.write_all(&buf).and_then(|()| file.flush()) {
                    if let Err(e) = file.set_len(len) {
                        log::error!("Couldn't roll back partial write: {e}");
                    }
                    return Err(e).context("Couldn't append records");
                }
                if *sync {
                    file.sync_data()?;
                }
            }
            Target::Stdout(stdout) => {
                let mut lock = stdout.lock();
                lock.write_all(&buf)?;
                lock.flush()?;
            }
        }
        Ok(())
    }
}

fn serialize<I, R, T>(config: &CsvWriterConfig, rows: I) -> anyhow::Result<Vec<u8>>
where
    I: IntoIterator<Item = R>,
    R: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut wtr = csv::WriterBuilder::from(config).from_writer(Vec::new());
    for row in rows {
        wtr.write_record(row)?;
    }
    wtr.into_inner()
        .map_err(|e| anyhow::anyhow!("Couldn't serialize records: {}", e.error()))
}

fn check_header(path: &Path, columns: &[String], config: &CsvWriterConfig) -> anyhow::Result<()> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(config.delimiter as u8)
        .has_headers(false)
        .flexible(true)
        .from_reader(fs_err::File::open(path)?);
    match rdr.records().next() {
        Some(Ok(header)) if header.iter().eq(columns.iter().map(String::as_str)) => (),
        Some(Ok(header)) => log::warn!(
            "Header of {} is {:?}, expected {columns:?}",
            path.display(),
            header.iter().collect::<Vec<_>>()
        ),
        Some(Err(e)) => log::warn!("Couldn't read header of {}: {e}", path.display()),
        None => (),
    }
    Ok(())
}
