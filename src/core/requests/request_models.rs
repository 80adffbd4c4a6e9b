// Domain models for the request workflow.
// Nothing in here knows about Google, HTTP or JSON wire formats; the infra layer
// converts to and from these types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Value written into the status column once a row has been handled.
pub const PROCESSED_MARKER: &str = "Processed";

/// Stable identifier of a sheet (tab) inside the spreadsheet.
pub type SheetId = i64;

// ============================================================================
// CELLS
// ============================================================================

/// A single spreadsheet cell as the processor sees it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum CellValue {
    #[default]
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
}

impl CellValue {
    /// Presence check used by the required-field validation.
    /// Only truly empty cells count as missing; `0` or `FALSE` are data.
    pub fn is_blank(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(text) => text.is_empty(),
            _ => false,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CellValue::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Empty => Ok(()),
            CellValue::Text(text) => f.write_str(text),
            // Spreadsheets hand back whole numbers as floats; print them the way
            // the sheet displays them.
            CellValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => {
                write!(f, "{}", *n as i64)
            }
            CellValue::Number(n) => write!(f, "{}", n),
            CellValue::Bool(true) => f.write_str("TRUE"),
            CellValue::Bool(false) => f.write_str("FALSE"),
        }
    }
}

impl From<&str> for CellValue {
    fn from(value: &str) -> Self {
        if value.is_empty() {
            CellValue::Empty
        } else {
            CellValue::Text(value.to_string())
        }
    }
}

impl From<String> for CellValue {
    fn from(value: String) -> Self {
        if value.is_empty() {
            CellValue::Empty
        } else {
            CellValue::Text(value)
        }
    }
}

impl From<f64> for CellValue {
    fn from(value: f64) -> Self {
        CellValue::Number(value)
    }
}

/// Rows of cells, top to bottom.
pub type Grid = Vec<Vec<CellValue>>;

// ============================================================================
// FORM ROWS AND EVENTS
// ============================================================================

/// One form submission as read from the data table.
#[derive(Debug, Clone)]
pub struct FormRow {
    /// 1-based row index in the data table.
    pub row: u32,
    pub timestamp: CellValue,
    pub fields: Vec<CellValue>,
}

impl FormRow {
    /// Field by zero-based data index. Out of range reads as empty.
    pub fn field(&self, index: usize) -> &CellValue {
        static EMPTY: CellValue = CellValue::Empty;
        self.fields.get(index).unwrap_or(&EMPTY)
    }

    pub fn request_id(&self) -> String {
        self.field(0).to_string()
    }

    pub fn recipient(&self) -> String {
        self.field(1).to_string()
    }
}

/// Edit notification delivered by the event source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditEvent {
    pub sheet_name: String,
    pub row: u32,
}

impl EditEvent {
    pub fn new(sheet_name: impl Into<String>, row: u32) -> Self {
        Self {
            sheet_name: sheet_name.into(),
            row,
        }
    }

    /// Only data-bearing rows of the data table trigger processing.
    pub fn targets(&self, data_sheet: &str) -> bool {
        self.sheet_name == data_sheet && self.row > 1
    }
}

/// What happened to a row after one invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Processed {
        pdf_name: String,
        file_id: String,
        recipients: Vec<String>,
        /// False only under the `SendAttempted` mark policy when the send failed.
        mail_sent: bool,
    },
    AlreadyProcessed,
    MissingRequired {
        fields: Vec<usize>,
    },
    /// The edit event did not target a data row.
    Ignored,
}

// ============================================================================
// OUTPUT ARTIFACTS
// ============================================================================

/// A rendered file ready to be persisted or attached.
#[derive(Debug, Clone, PartialEq)]
pub struct FileBlob {
    pub name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl FileBlob {
    pub fn pdf(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: "application/pdf".to_string(),
            data,
        }
    }
}

/// Outgoing email.
#[derive(Debug, Clone, PartialEq)]
pub struct MailMessage {
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub sender_name: String,
    pub attachments: Vec<FileBlob>,
}

/// Paper sizes understood by the spreadsheet PDF export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaperSize {
    Letter,
    Legal,
    A3,
    A4,
    A5,
}

/// Layout parameters passed to the document renderer.
#[derive(Debug, Clone, PartialEq)]
pub struct PdfLayout {
    pub paper: PaperSize,
    pub portrait: bool,
    pub fit_to_width: bool,
    pub gridlines: bool,
    pub print_title: bool,
    pub sheet_names: bool,
    pub page_numbers: bool,
    pub repeat_frozen_rows: bool,
    /// Margins in inches: top, bottom, left, right.
    pub margins: [f32; 4],
}

impl Default for PdfLayout {
    fn default() -> Self {
        Self {
            paper: PaperSize::A4,
            portrait: true,
            fit_to_width: true,
            gridlines: false,
            print_title: false,
            sheet_names: false,
            page_numbers: false,
            repeat_frozen_rows: true,
            margins: [0.5, 0.25, 0.5, 0.5],
        }
    }
}
