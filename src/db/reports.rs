//! Per-account report accumulation.
//!
//! Every pipeline action appends a tagged line; at account completion the
//! entry is drained (read-and-clear) and rendered into the block handed to the
//! notification sink. Success/failure lines feed a success-rate counter,
//! neutral lines do not.

use crate::db::{read_doc, write_doc};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    /// Informational line, excluded from the success rate.
    Neutral,
}

impl Outcome {
    fn marker(self) -> &'static str {
        match self {
            Outcome::Success => "✅ ",
            Outcome::Failure => "❌ ",
            Outcome::Neutral => "",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReportLine {
    text: String,
    outcome: Outcome,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ReportEntry {
    lines: Vec<ReportLine>,
    successes: u32,
    attempts: u32,
}

type ReportsDoc = HashMap<String, ReportEntry>;

/// Durable report store. Cheap to clone; all clones share one document lock.
#[derive(Clone)]
pub struct ReportStore {
    path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl ReportStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path: Arc::new(path),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Append one line to the account's entry, creating it lazily. Persisted
    /// immediately.
    pub async fn append(&self, encoded_key: &str, text: &str, outcome: Outcome) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut doc: ReportsDoc = read_doc(self.path.as_ref())?;
        let entry = doc.entry(encoded_key.to_string()).or_default();
        entry.lines.push(ReportLine {
            text: text.to_string(),
            outcome,
        });
        if outcome != Outcome::Neutral {
            entry.attempts += 1;
            if outcome == Outcome::Success {
                entry.successes += 1;
            }
        }
        write_doc(self.path.as_ref(), &doc)?;
        Ok(())
    }

    /// Read-and-clear the account's entry and render the notification block:
    /// progress + address header, each line with its marker, and a trailing
    /// success-rate summary when anything was attempted.
    pub async fn drain_and_render(
        &self,
        encoded_key: &str,
        address: &str,
        progress: (usize, usize),
    ) -> Result<String> {
        let _guard = self.lock.lock().await;
        let mut doc: ReportsDoc = read_doc(self.path.as_ref())?;
        let header = format!("[{}/{}] {address}", progress.0, progress.1);

        let Some(entry) = doc.remove(encoded_key) else {
            return Ok(format!("{header}\n\nNo actions"));
        };
        write_doc(self.path.as_ref(), &doc)?;

        let mut block = header;
        block.push_str("\n\n");
        for line in &entry.lines {
            block.push_str(line.outcome.marker());
            block.push_str(&line.text);
            block.push('\n');
        }
        if entry.attempts > 0 {
            block.push_str(&format!(
                "\nSuccess rate {}/{}",
                entry.successes, entry.attempts
            ));
        }
        Ok(block)
    }

    /// Drop every entry. Runs as part of bulk account creation.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        write_doc(self.path.as_ref(), &ReportsDoc::new())?;
        Ok(())
    }
}
