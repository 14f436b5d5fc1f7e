//! Line-oriented progress log tailed by external viewers

use crate::Result;
use crossterm::style::Stylize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use tracing::warn;

/// Per-candidate verdict marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
    Ok,
    Fail,
    Skip,
}

impl Mark {
    fn plain(&self) -> &'static str {
        match self {
            Mark::Ok => "OK",
            Mark::Fail => "FAIL",
            Mark::Skip => "SKIP",
        }
    }

    fn colored(&self) -> String {
        match self {
            Mark::Ok => self.plain().green().bold().to_string(),
            Mark::Fail => self.plain().red().bold().to_string(),
            Mark::Skip => self.plain().yellow().to_string(),
        }
    }
}

/// One line per candidate: `<index>. <address> <MARK> <detail>`
pub struct ProgressLog {
    file: Option<File>,
    lines: Vec<String>,
}

impl ProgressLog {
    /// Start a fresh log, truncating `path` if given
    pub fn create(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => Some(
                OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(path)?,
            ),
            None => None,
        };
        Ok(Self {
            file,
            lines: Vec::new(),
        })
    }

    pub fn line(&mut self, index: usize, address: &str, mark: Mark, detail: &str) {
        let plain = format!("{}. {} {} {}", index, address, mark.plain(), detail);
        if let Some(file) = self.file.as_mut() {
            let colored = format!("{}. {} {} {}\n", index, address, mark.colored(), detail);
            if let Err(e) = file.write_all(colored.as_bytes()).and_then(|_| file.flush()) {
                warn!(error = %e, "failed to write progress line");
            }
        }
        self.lines.push(plain);
    }

    /// Uncolored lines written so far
    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}
