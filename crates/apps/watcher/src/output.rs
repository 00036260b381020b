//! JSON-lines output on stdout

use anyhow::{Context, Result};
use chrono::Utc;
use log::debug;
use mailwatch::{RecordBatch, RecordOutcome};
use std::io::Write;

/// Render the matched and failed records of a batch, one JSON object per line
///
/// Filtered records are counted in the log but not printed.
pub fn render_batch(batch: &RecordBatch) -> Result<Vec<String>> {
    let emitted_at = Utc::now();
    let mut lines = Vec::new();
    let mut filtered = 0;

    for record in &batch.records {
        if matches!(record.record.outcome, RecordOutcome::Filtered { .. }) {
            filtered += 1;
            continue;
        }
        let mut value = serde_json::to_value(record).context("Failed to serialize record")?;
        if let Some(object) = value.as_object_mut() {
            object.insert("emitted_at".into(), serde_json::json!(emitted_at));
        }
        lines.push(value.to_string());
    }

    debug!(
        "{}: {} records, {} filtered",
        batch.token,
        batch.len(),
        filtered
    );
    Ok(lines)
}

pub fn write_batch(batch: &RecordBatch) -> Result<()> {
    let lines = render_batch(batch)?;
    if lines.is_empty() {
        return Ok(());
    }
    let mut stdout = std::io::stdout().lock();
    for line in lines {
        writeln!(stdout, "{line}")?;
    }
    stdout.flush()?;
    Ok(())
}
