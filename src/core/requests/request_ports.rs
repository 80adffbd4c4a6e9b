// Ports for the external collaborators.
// The core defines WHAT it needs from the spreadsheet, renderer, file store and
// mailer; `infra/` provides the Google and in-memory implementations.

use async_trait::async_trait;
use thiserror::Error;

use super::request_models::{CellValue, FileBlob, Grid, MailMessage, PdfLayout, SheetId};
use super::template::{CellAddress, CellRange};

/// Failure reported by any collaborator. The message carries the platform detail.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CollaboratorError {
    #[error("Spreadsheet error: {0}")]
    Tabular(String),

    #[error("Sheet not found: {0}")]
    SheetNotFound(String),

    #[error("PDF export failed: {0}")]
    Render(String),

    #[error("File store error: {0}")]
    Files(String),

    #[error("Mail error: {0}")]
    Mail(String),

    #[error("Authentication failed: {0}")]
    Auth(String),
}

/// Cell-level access to the spreadsheet.
#[async_trait]
pub trait TabularStore: Send + Sync {
    async fn sheet_id(&self, sheet: &str) -> Result<SheetId, CollaboratorError>;

    /// Reads a rectangular range. Rows and columns past the sheet's data are
    /// padded with `CellValue::Empty` so the result always has the range's shape.
    async fn read_range(&self, sheet: &str, range: CellRange) -> Result<Grid, CollaboratorError>;

    /// Everything from A1 to the last cell holding data.
    async fn read_used_range(&self, sheet: &str) -> Result<Grid, CollaboratorError>;

    async fn write_range(
        &self,
        sheet: &str,
        range: CellRange,
        values: Grid,
    ) -> Result<(), CollaboratorError>;

    /// Writes scattered cells. Implementations with a batch API should override this.
    async fn write_cells(
        &self,
        sheet: &str,
        cells: Vec<(CellAddress, CellValue)>,
    ) -> Result<(), CollaboratorError> {
        for (address, value) in cells {
            self.write_cell(sheet, address, value).await?;
        }
        Ok(())
    }

    /// Number of rows in use, header included.
    async fn row_count(&self, sheet: &str) -> Result<u32, CollaboratorError>;

    /// Copies a sheet under a new name and returns the copy's id.
    async fn duplicate_sheet(&self, sheet: &str, new_name: &str)
        -> Result<SheetId, CollaboratorError>;

    async fn delete_sheet(&self, sheet_id: SheetId) -> Result<(), CollaboratorError>;

    async fn read_cell(
        &self,
        sheet: &str,
        address: CellAddress,
    ) -> Result<CellValue, CollaboratorError> {
        let grid = self.read_range(sheet, CellRange::single(address)).await?;
        Ok(grid
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .unwrap_or_default())
    }

    async fn write_cell(
        &self,
        sheet: &str,
        address: CellAddress,
        value: CellValue,
    ) -> Result<(), CollaboratorError> {
        self.write_range(sheet, CellRange::single(address), vec![vec![value]])
            .await
    }
}

/// Turns a sheet into a PDF.
#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    async fn render_pdf(
        &self,
        sheet_id: SheetId,
        layout: &PdfLayout,
    ) -> Result<Vec<u8>, CollaboratorError>;
}

/// Folder-and-file storage for generated documents.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Ids of every folder with exactly this name.
    async fn find_folders(&self, name: &str) -> Result<Vec<String>, CollaboratorError>;

    async fn create_folder(&self, name: &str) -> Result<String, CollaboratorError>;

    /// Stores the blob inside the folder and returns the new file's id.
    async fn create_file(&self, folder_id: &str, file: &FileBlob)
        -> Result<String, CollaboratorError>;
}

#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, message: &MailMessage) -> Result<(), CollaboratorError>;
}
