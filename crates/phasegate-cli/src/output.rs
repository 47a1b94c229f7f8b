use phasegate_core::checkpoint::HistoryItem;
use phasegate_core::dispatch::ActionInvocation;
use phasegate_core::instance::WorkflowInstance;
use serde::Serialize;

use crate::cmd::short;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// Anything that renders as one line of a table.
pub trait Row {
    fn cells(&self) -> Vec<String>;
}

impl<R: Row + ?Sized> Row for &R {
    fn cells(&self) -> Vec<String> {
        (**self).cells()
    }
}

impl Row for Vec<String> {
    fn cells(&self) -> Vec<String> {
        self.clone()
    }
}

/// CHECKPOINT, PHASE, REASON, CREATED, superseded marker
impl Row for HistoryItem<'_> {
    fn cells(&self) -> Vec<String> {
        vec![
            short(&self.checkpoint.id),
            self.checkpoint.phase.clone(),
            self.checkpoint.reason.to_string(),
            self.checkpoint.created_at.format(TIME_FORMAT).to_string(),
            if self.superseded { "superseded" } else { "" }.to_string(),
        ]
    }
}

/// STARTED, PHASE, ACTION, KIND, OUTCOME, DURATION
impl Row for ActionInvocation {
    fn cells(&self) -> Vec<String> {
        let millis = (self.finished_at - self.started_at).num_milliseconds();
        vec![
            self.started_at.format(TIME_FORMAT).to_string(),
            self.phase.clone(),
            self.action_ref.clone(),
            if self.mandatory { "mandatory" } else { "optional" }.to_string(),
            self.outcome.to_string(),
            format!("{millis}ms"),
        ]
    }
}

/// ID, TEMPLATE, PHASE, STATUS, LIFECYCLE
impl Row for WorkflowInstance {
    fn cells(&self) -> Vec<String> {
        vec![
            short(&self.id),
            self.template_id().to_string(),
            self.current_phase().to_string(),
            self.phase_status().to_string(),
            self.lifecycle().to_string(),
        ]
    }
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

pub fn print_table<R: Row>(headers: &[&str], rows: impl IntoIterator<Item = R>) {
    for line in render_table(headers, rows) {
        println!("{line}");
    }
}

/// Columns are sized in chars, not bytes, so criteria and actor names
/// outside ASCII stay aligned. The last column is not padded.
fn render_table<R: Row>(headers: &[&str], rows: impl IntoIterator<Item = R>) -> Vec<String> {
    let rows: Vec<Vec<String>> = rows.into_iter().map(|r| r.cells()).collect();
    let mut widths: Vec<usize> = headers.iter().map(|h| h.chars().count()).collect();
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let header: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
    let separator: Vec<String> = widths.iter().map(|&w| "-".repeat(w)).collect();

    let mut lines = Vec::with_capacity(rows.len() + 2);
    lines.push(join_padded(&header, &widths));
    lines.push(separator.join("  ").trim_end().to_string());
    for row in &rows {
        lines.push(join_padded(row, &widths));
    }
    lines
}

fn join_padded(cells: &[String], widths: &[usize]) -> String {
    let last = cells.len().min(widths.len()).saturating_sub(1);
    let padded: Vec<String> = cells
        .iter()
        .zip(widths)
        .enumerate()
        .map(|(i, (cell, &width))| {
            if i == last {
                cell.clone()
            } else {
                let fill = width.saturating_sub(cell.chars().count());
                format!("{cell}{}", " ".repeat(fill))
            }
        })
        .collect();
    padded.join("  ").trim_end().to_string()
}
