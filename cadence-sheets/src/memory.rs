//! In-memory worksheet used by tests and dry runs.

use async_trait::async_trait;
use tokio::sync::Mutex;

use cadence_core::RowIndex;

use crate::{SheetError, Worksheet};

/// A worksheet held entirely in memory, mirroring the 1-based addressing of
/// the real adapter.
#[derive(Default)]
pub struct MemoryWorksheet {
    rows: Mutex<Vec<Vec<String>>>,
}

impl MemoryWorksheet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_rows(rows: Vec<Vec<String>>) -> Self {
        Self {
            rows: Mutex::new(rows),
        }
    }

    /// Snapshot of the current contents, for assertions.
    pub async fn snapshot(&self) -> Vec<Vec<String>> {
        self.rows.lock().await.clone()
    }
}

#[async_trait]
impl Worksheet for MemoryWorksheet {
    async fn read_all(&self) -> Result<Vec<Vec<String>>, SheetError> {
        Ok(self.rows.lock().await.clone())
    }

    async fn read_row(&self, row: RowIndex) -> Result<Vec<String>, SheetError> {
        let rows = self.rows.lock().await;
        Ok(rows.get(row.saturating_sub(1)).cloned().unwrap_or_default())
    }

    async fn update_cell(
        &self,
        row: RowIndex,
        col: usize,
        value: &str,
    ) -> Result<(), SheetError> {
        if row == 0 || col == 0 {
            return Err(SheetError::Io("rows and columns are 1-based".into()));
        }
        let mut rows = self.rows.lock().await;
        if rows.len() < row {
            rows.resize(row, Vec::new());
        }
        let cells = &mut rows[row - 1];
        if cells.len() < col {
            cells.resize(col, String::new());
        }
        cells[col - 1] = value.to_string();
        Ok(())
    }
}
