//! Materialised query results with row-level selection state.

use std::collections::HashMap;

use crate::model::AttrValue;

/// Column labels, format hints and the primary kind of a result.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultHeader {
    pub partition: String,
    pub primary_kind: String,
    pub labels: Vec<String>,
    pub format: Vec<String>,
}

/// Row selection operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Row(usize),
    All,
    None,
    Invert,
}

/// An ordered list of rows, their per-cell source references
/// (`n|e:kind:key`) and a mutable selection bitmap.
///
/// Rows and sources are immutable once materialised; only the selection
/// state changes afterwards.
#[derive(Debug, Clone)]
pub struct SearchResult {
    header: ResultHeader,
    rows: Vec<Vec<AttrValue>>,
    sources: Vec<Vec<String>>,
    selections: Vec<bool>,
}

impl SearchResult {
    pub(crate) fn new(
        header: ResultHeader,
        rows: Vec<Vec<AttrValue>>,
        sources: Vec<Vec<String>>,
    ) -> Self {
        let selections = vec![true; rows.len()];
        Self {
            header,
            rows,
            sources,
            selections,
        }
    }

    pub fn header(&self) -> &ResultHeader {
        &self.header
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &[Vec<AttrValue>] {
        &self.rows
    }

    pub fn sources(&self) -> &[Vec<String>] {
        &self.sources
    }

    /// A page of rows; the full count is available via
    /// [`SearchResult::row_count`].
    pub fn rows_page(&self, offset: usize, limit: usize) -> &[Vec<AttrValue>] {
        let start = offset.min(self.rows.len());
        let end = offset.saturating_add(limit).min(self.rows.len());
        &self.rows[start..end]
    }

    pub fn selections(&self) -> &[bool] {
        &self.selections
    }

    /// Mutates the selection bitmap. Out-of-range row indexes are ignored.
    pub fn select(&mut self, selection: Selection) {
        match selection {
            Selection::Row(index) => {
                if let Some(slot) = self.selections.get_mut(index) {
                    *slot = !*slot;
                }
            }
            Selection::All => self.selections.fill(true),
            Selection::None => self.selections.fill(false),
            Selection::Invert => {
                for slot in &mut self.selections {
                    *slot = !*slot;
                }
            }
        }
    }

    pub fn total_selections(&self) -> usize {
        self.selections.iter().filter(|&&s| s).count()
    }

    /// Source lists of the currently selected rows.
    pub(crate) fn selected_sources(&self) -> impl Iterator<Item = &[String]> {
        self.sources
            .iter()
            .zip(self.selections.iter())
            .filter(|(_, &selected)| selected)
            .map(|(sources, _)| sources.as_slice())
    }

    /// The whole result as CSV: header labels, then one line per row.
    pub fn csv(&self) -> String {
        let mut out = String::new();
        out.push_str(&join_csv_line(self.header.labels.iter().cloned()));
        out.push('\n');
        for row in &self.rows {
            out.push_str(&join_csv_line(row.iter().map(|cell| cell.to_string())));
            out.push('\n');
        }
        out
    }

    /// Value-frequency histogram of a column: the top `limit` distinct
    /// values, most frequent first, ties broken by value.
    pub fn quickfilter(&self, column: usize, limit: usize) -> Vec<(String, usize)> {
        let mut frequencies: HashMap<String, usize> = HashMap::new();
        for row in &self.rows {
            if let Some(cell) = row.get(column) {
                *frequencies.entry(cell.to_string()).or_insert(0) += 1;
            }
        }
        let mut entries: Vec<(String, usize)> = frequencies.into_iter().collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        entries.truncate(limit);
        entries
    }
}

fn join_csv_line(cells: impl Iterator<Item = String>) -> String {
    cells
        .map(|cell| {
            if cell.contains(',') || cell.contains('"') || cell.contains('\n') {
                format!("\"{}\"", cell.replace('"', "\"\""))
            } else {
                cell
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}
