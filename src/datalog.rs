//! CSV data logger
//!
//! Runs on its own blocking task, fed by the publisher. Rows are written in
//! arrival order; a slow disk never holds up the session.

use crate::config::{Config, Output};
use crate::dataframe::DataFrame;
use chrono::Local;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

pub struct DataLogger<W: Write> {
    sink: W,
    rows: u64,
}

impl DataLogger<Box<dyn Write + Send>> {
    /// Logger for the configured output: a new timestamped CSV file or stdout
    pub fn create(config: &Config) -> io::Result<Self> {
        let sink: Box<dyn Write + Send> = match config.output {
            Output::Stdout => Box::new(io::stdout()),
            Output::File => {
                let path = log_file_path(config);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let file = File::create(&path)?;
                info!("Logging data frames to {}", path.display());
                Box::new(BufWriter::new(file))
            }
        };
        Ok(Self::new(sink))
    }
}

impl<W: Write> DataLogger<W> {
    pub fn new(sink: W) -> Self {
        Self { sink, rows: 0 }
    }

    /// Append one frame, writing the header before the first row
    pub fn append(&mut self, frame: &DataFrame) -> io::Result<()> {
        if self.rows == 0 {
            writeln!(self.sink, "{}", DataFrame::csv_header())?;
        }
        writeln!(self.sink, "{}", frame.csv_row())?;
        self.sink.flush()?;
        self.rows += 1;
        Ok(())
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn into_inner(self) -> W {
        self.sink
    }
}

/// `<log folder>/<YYYY-MM-DD-HHMMSS>.csv`
pub fn log_file_path(config: &Config) -> PathBuf {
    let name = format!("{}.csv", Local::now().format("%Y-%m-%d-%H%M%S"));
    config.log_folder.join(name)
}

/// Consume frames until every sender is dropped
pub fn spawn<W>(mut logger: DataLogger<W>, mut frames: mpsc::Receiver<DataFrame>) -> JoinHandle<()>
where
    W: Write + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        while let Some(frame) = frames.blocking_recv() {
            if let Err(e) = logger.append(&frame) {
                error!("Failed to write data frame: {}", e);
            }
        }
        info!("Data logger stopped after {} frames", logger.rows());
    })
}
