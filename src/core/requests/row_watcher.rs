// Edit notifications for the data table.
//
// The spreadsheet does not push events to us, so the composition root polls.
// Each poll reads the data rows and keeps a fingerprint per row. A row is
// reported when it is new or its contents changed since the last poll, unless
// its status cell already says `Processed`. So the first poll reports every
// pending row, and an edit to a skipped or failed row triggers it again.

use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::debug;

use super::request_models::{CellValue, EditEvent, PROCESSED_MARKER};
use super::request_ports::{CollaboratorError, TabularStore};
use super::template::{CellAddress, CellRange};

pub struct RowWatcher<T: TabularStore> {
    tabular: Arc<T>,
    sheet: String,
    status_column: u32,
    /// Fingerprint of each data row as of the last poll.
    seen: DashMap<u32, u64>,
}

fn fingerprint(cells: &[CellValue]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for cell in cells {
        match cell {
            CellValue::Empty => 0u8.hash(&mut hasher),
            CellValue::Text(text) => {
                1u8.hash(&mut hasher);
                text.hash(&mut hasher);
            }
            CellValue::Number(n) => {
                2u8.hash(&mut hasher);
                n.to_bits().hash(&mut hasher);
            }
            CellValue::Bool(b) => {
                3u8.hash(&mut hasher);
                b.hash(&mut hasher);
            }
        }
    }
    hasher.finish()
}

impl<T: TabularStore> RowWatcher<T> {
    pub fn new(tabular: Arc<T>, sheet: impl Into<String>, status_column: u32) -> Self {
        Self {
            tabular,
            sheet: sheet.into(),
            status_column: status_column.max(1),
            seen: DashMap::new(),
        }
    }

    pub async fn poll(&self) -> Result<Vec<EditEvent>, CollaboratorError> {
        let count = self.tabular.row_count(&self.sheet).await?;
        self.seen.retain(|row, _| *row <= count);
        if count < 2 {
            return Ok(Vec::new());
        }

        let grid = self
            .tabular
            .read_range(
                &self.sheet,
                CellRange::new(CellAddress::new(1, 2), count - 1, self.status_column),
            )
            .await?;

        let mut events = Vec::new();
        for (offset, cells) in grid.iter().enumerate() {
            let row = offset as u32 + 2;
            let print = fingerprint(cells);
            if self.seen.insert(row, print) == Some(print) {
                continue;
            }

            let status = cells.get(self.status_column as usize - 1);
            if matches!(status, Some(CellValue::Text(text)) if text == PROCESSED_MARKER) {
                continue;
            }
            events.push(EditEvent::new(self.sheet.clone(), row));
        }

        if !events.is_empty() {
            debug!(sheet = %self.sheet, count = events.len(), "Rows changed");
        }
        Ok(events)
    }

    /// Drops what is known about a row so the next poll reports it again.
    pub fn forget(&self, row: u32) {
        self.seen.remove(&row);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::memory::InMemorySpreadsheet;

    const DATA: &str = "Form Responses 1";
    const STATUS: u32 = 4;

    fn rows(n: usize) -> Vec<Vec<CellValue>> {
        (0..n).map(|i| vec![CellValue::from(format!("r{}", i))]).collect()
    }

    fn watch(sheet: &Arc<InMemorySpreadsheet>) -> RowWatcher<InMemorySpreadsheet> {
        RowWatcher::new(Arc::clone(sheet), DATA, STATUS)
    }

    fn polled(events: Vec<EditEvent>) -> Vec<u32> {
        events.iter().map(|e| e.row).collect()
    }

    #[tokio::test]
    async fn first_poll_reports_every_data_row() {
        let sheet = Arc::new(InMemorySpreadsheet::new().with_sheet(DATA, rows(4)));
        let watcher = watch(&sheet);

        assert_eq!(polled(watcher.poll().await.unwrap()), vec![2, 3, 4]);
        assert!(watcher.poll().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn new_rows_are_reported_once() {
        let sheet = Arc::new(InMemorySpreadsheet::new().with_sheet(DATA, rows(2)));
        let watcher = watch(&sheet);
        watcher.poll().await.unwrap();

        sheet.set_cell(DATA, CellAddress::new(1, 3), CellValue::from("new"));
        sheet.set_cell(DATA, CellAddress::new(1, 4), CellValue::from("newer"));

        let events = watcher.poll().await.unwrap();
        assert_eq!(
            events,
            vec![EditEvent::new(DATA, 3), EditEvent::new(DATA, 4)]
        );
        assert!(watcher.poll().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn editing_an_existing_row_reports_it_again() {
        let sheet = Arc::new(InMemorySpreadsheet::new().with_sheet(DATA, rows(3)));
        let watcher = watch(&sheet);
        assert_eq!(polled(watcher.poll().await.unwrap()), vec![2, 3]);

        // Row 2 was skipped for a missing part number; the submitter fills it in.
        sheet.set_cell(DATA, CellAddress::new(3, 2), CellValue::from("PN1"));

        assert_eq!(
            watcher.poll().await.unwrap(),
            vec![EditEvent::new(DATA, 2)]
        );
        assert!(watcher.poll().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn processed_rows_are_not_reported() {
        let sheet = Arc::new(InMemorySpreadsheet::new().with_sheet(DATA, rows(3)));
        sheet.set_cell(DATA, CellAddress::new(STATUS, 3), CellValue::from(PROCESSED_MARKER));
        let watcher = watch(&sheet);

        assert_eq!(polled(watcher.poll().await.unwrap()), vec![2]);

        // Marking a row changes it, but it is done.
        sheet.set_cell(DATA, CellAddress::new(STATUS, 2), CellValue::from(PROCESSED_MARKER));
        assert!(watcher.poll().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn forgotten_rows_are_reported_on_the_next_poll() {
        let sheet = Arc::new(InMemorySpreadsheet::new().with_sheet(DATA, rows(3)));
        let watcher = watch(&sheet);
        watcher.poll().await.unwrap();

        watcher.forget(3);

        assert_eq!(polled(watcher.poll().await.unwrap()), vec![3]);
    }

    #[tokio::test]
    async fn header_only_table_reports_nothing() {
        let sheet = Arc::new(InMemorySpreadsheet::new().with_sheet(DATA, rows(1)));
        let watcher = watch(&sheet);

        assert!(watcher.poll().await.unwrap().is_empty());
    }
}
