//! Stdout output handler.
//!
//! Prints events as JSON lines, suitable for piping to other tools.

use super::{EventHandler, EventRecord};
use crate::events::HubEvent;
use async_trait::async_trait;

/// Handler that prints events to stdout as JSON lines.
pub struct StdoutHandler {
    pretty: bool,
}

impl StdoutHandler {
    /// One compact JSON record per line.
    pub fn new() -> Self {
        Self { pretty: false }
    }

    /// Indented records, for reading by eye.
    pub fn pretty() -> Self {
        Self { pretty: true }
    }

    fn render(&self, event: &HubEvent) -> anyhow::Result<String> {
        let record = EventRecord::new(event);
        let output = if self.pretty {
            serde_json::to_string_pretty(&record)?
        } else {
            serde_json::to_string(&record)?
        };
        Ok(output)
    }
}

impl Default for StdoutHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventHandler for StdoutHandler {
    async fn handle(&self, event: &HubEvent) -> anyhow::Result<()> {
        println!("{}", self.render(event)?);
        Ok(())
    }
}
