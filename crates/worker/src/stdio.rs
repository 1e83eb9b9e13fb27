//! Line-delimited stdin/stdout transport.
//!
//! A development harness implementing the queue traits over standard
//! streams: one JSON job per input line, one JSON message per output line.
//! Production deployments plug their queue client into the same traits.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;
use tracing::debug;

use crate::job::{JobPublisher, JobSource};

/// Reads one job payload per stdin line.
pub struct StdinJobSource {
    lines: Mutex<Lines<BufReader<Stdin>>>,
}

impl StdinJobSource {
    #[must_use]
    pub fn new() -> Self {
        Self { lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()) }
    }
}

impl Default for StdinJobSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobSource for StdinJobSource {
    async fn next_job(&self) -> Option<String> {
        loop {
            let line = self.lines.lock().await.next_line().await.ok().flatten()?;
            let line = line.trim().to_string();
            if !line.is_empty() {
                return Some(line);
            }
        }
    }
}

/// Writes every published message as one stdout line.
pub struct StdoutPublisher;

#[async_trait]
impl JobPublisher for StdoutPublisher {
    async fn publish(&self, tube: &str, message: serde_json::Value) {
        debug!(%tube, "publishing");
        println!("{message}");
    }
}
