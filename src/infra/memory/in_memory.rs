// In-memory implementations of the request ports.
//
// They behave like the real collaborators closely enough to run the whole row
// protocol in tests: sheets keep grids of cells, the "PDF" is a text dump of the
// sheet at export time, folders and mails are simply recorded.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;

use crate::core::requests::request_models::{
    CellValue, FileBlob, Grid, MailMessage, PdfLayout, SheetId,
};
use crate::core::requests::request_ports::{
    CollaboratorError, DocumentRenderer, FileStore, MailSender, TabularStore,
};
use crate::core::requests::template::{CellAddress, CellRange};

// ============================================================================
// SPREADSHEET
// ============================================================================

#[derive(Clone, Debug)]
struct MemorySheet {
    id: SheetId,
    grid: Grid,
}

/// Spreadsheet and renderer in one, like the real platform.
pub struct InMemorySpreadsheet {
    sheets: DashMap<String, MemorySheet>,
    next_id: AtomicI64,
    fail_render: AtomicBool,
    rendered: Mutex<Vec<Grid>>,
}

impl InMemorySpreadsheet {
    pub fn new() -> Self {
        Self {
            sheets: DashMap::new(),
            next_id: AtomicI64::new(0),
            fail_render: AtomicBool::new(false),
            rendered: Mutex::new(Vec::new()),
        }
    }

    pub fn with_sheet(self, name: &str, grid: Grid) -> Self {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sheets
            .insert(name.to_string(), MemorySheet { id, grid });
        self
    }

    pub fn grid(&self, name: &str) -> Option<Grid> {
        self.sheets.get(name).map(|sheet| sheet.grid.clone())
    }

    pub fn cell(&self, name: &str, address: CellAddress) -> CellValue {
        self.grid(name)
            .and_then(|grid| {
                grid.get(address.row as usize - 1)
                    .and_then(|row| row.get(address.column as usize - 1))
                    .cloned()
            })
            .unwrap_or_default()
    }

    pub fn set_cell(&self, name: &str, address: CellAddress, value: CellValue) {
        if let Some(mut sheet) = self.sheets.get_mut(name) {
            put(&mut sheet.grid, address, value);
        }
    }

    pub fn sheet_names(&self) -> Vec<String> {
        self.sheets.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Grids of every sheet exported so far, in export order.
    pub fn rendered(&self) -> Vec<Grid> {
        self.rendered.lock().unwrap().clone()
    }

    pub fn fail_renders(&self, fail: bool) {
        self.fail_render.store(fail, Ordering::SeqCst);
    }

    fn missing(name: &str) -> CollaboratorError {
        CollaboratorError::SheetNotFound(name.to_string())
    }
}

impl Default for InMemorySpreadsheet {
    fn default() -> Self {
        Self::new()
    }
}

fn put(grid: &mut Grid, address: CellAddress, value: CellValue) {
    let row = address.row as usize - 1;
    let column = address.column as usize - 1;
    if grid.len() <= row {
        grid.resize_with(row + 1, Vec::new);
    }
    let line = &mut grid[row];
    if line.len() <= column {
        line.resize(column + 1, CellValue::Empty);
    }
    line[column] = value;
}

#[async_trait]
impl TabularStore for InMemorySpreadsheet {
    async fn sheet_id(&self, sheet: &str) -> Result<SheetId, CollaboratorError> {
        self.sheets
            .get(sheet)
            .map(|s| s.id)
            .ok_or_else(|| Self::missing(sheet))
    }

    async fn read_range(&self, sheet: &str, range: CellRange) -> Result<Grid, CollaboratorError> {
        let data = self.sheets.get(sheet).ok_or_else(|| Self::missing(sheet))?;

        let grid = (0..range.rows)
            .map(|r| {
                (0..range.columns)
                    .map(|c| {
                        data.grid
                            .get((range.start.row + r) as usize - 1)
                            .and_then(|row| row.get((range.start.column + c) as usize - 1))
                            .cloned()
                            .unwrap_or_default()
                    })
                    .collect()
            })
            .collect();
        Ok(grid)
    }

    async fn read_used_range(&self, sheet: &str) -> Result<Grid, CollaboratorError> {
        self.grid(sheet).ok_or_else(|| Self::missing(sheet))
    }

    async fn write_range(
        &self,
        sheet: &str,
        range: CellRange,
        values: Grid,
    ) -> Result<(), CollaboratorError> {
        let mut data = self
            .sheets
            .get_mut(sheet)
            .ok_or_else(|| Self::missing(sheet))?;

        for (r, row) in values.into_iter().enumerate().take(range.rows as usize) {
            for (c, value) in row.into_iter().enumerate().take(range.columns as usize) {
                let address =
                    CellAddress::new(range.start.column + c as u32, range.start.row + r as u32);
                put(&mut data.grid, address, value);
            }
        }
        Ok(())
    }

    async fn row_count(&self, sheet: &str) -> Result<u32, CollaboratorError> {
        self.sheets
            .get(sheet)
            .map(|s| s.grid.len() as u32)
            .ok_or_else(|| Self::missing(sheet))
    }

    async fn duplicate_sheet(
        &self,
        sheet: &str,
        new_name: &str,
    ) -> Result<SheetId, CollaboratorError> {
        let grid = self.grid(sheet).ok_or_else(|| Self::missing(sheet))?;
        if self.sheets.contains_key(new_name) {
            return Err(CollaboratorError::Tabular(format!(
                "A sheet named '{}' already exists",
                new_name
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sheets
            .insert(new_name.to_string(), MemorySheet { id, grid });
        Ok(id)
    }

    async fn delete_sheet(&self, sheet_id: SheetId) -> Result<(), CollaboratorError> {
        let name = self
            .sheets
            .iter()
            .find(|entry| entry.id == sheet_id)
            .map(|entry| entry.key().clone())
            .ok_or_else(|| Self::missing(&sheet_id.to_string()))?;
        self.sheets.remove(&name);
        Ok(())
    }
}

#[async_trait]
impl DocumentRenderer for InMemorySpreadsheet {
    async fn render_pdf(
        &self,
        sheet_id: SheetId,
        _layout: &PdfLayout,
    ) -> Result<Vec<u8>, CollaboratorError> {
        if self.fail_render.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Render("renderer unavailable".to_string()));
        }

        let grid = self
            .sheets
            .iter()
            .find(|entry| entry.id == sheet_id)
            .map(|entry| entry.grid.clone())
            .ok_or_else(|| Self::missing(&sheet_id.to_string()))?;

        let mut pdf = b"%PDF-1.4\n".to_vec();
        for row in &grid {
            let line: Vec<String> = row.iter().map(ToString::to_string).collect();
            pdf.extend_from_slice(line.join("\t").as_bytes());
            pdf.push(b'\n');
        }

        self.rendered.lock().unwrap().push(grid);
        Ok(pdf)
    }
}

// ============================================================================
// FILE STORE
// ============================================================================

#[derive(Clone, Debug)]
struct MemoryFolder {
    name: String,
    files: Vec<FileBlob>,
}

pub struct InMemoryDrive {
    folders: DashMap<String, MemoryFolder>,
    next_id: AtomicI64,
}

impl InMemoryDrive {
    pub fn new() -> Self {
        Self {
            folders: DashMap::new(),
            next_id: AtomicI64::new(1),
        }
    }

    pub fn folder_count(&self, name: &str) -> usize {
        self.folders.iter().filter(|f| f.name == name).count()
    }

    /// Files across every folder with this name.
    pub fn files_in(&self, name: &str) -> Vec<FileBlob> {
        self.folders
            .iter()
            .filter(|f| f.name == name)
            .flat_map(|f| f.files.clone())
            .collect()
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for InMemoryDrive {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileStore for InMemoryDrive {
    async fn find_folders(&self, name: &str) -> Result<Vec<String>, CollaboratorError> {
        let mut ids: Vec<String> = self
            .folders
            .iter()
            .filter(|f| f.name == name)
            .map(|f| f.key().clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn create_folder(&self, name: &str) -> Result<String, CollaboratorError> {
        let id = self.next_id("folder");
        self.folders.insert(
            id.clone(),
            MemoryFolder {
                name: name.to_string(),
                files: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn create_file(
        &self,
        folder_id: &str,
        file: &FileBlob,
    ) -> Result<String, CollaboratorError> {
        let mut folder = self
            .folders
            .get_mut(folder_id)
            .ok_or_else(|| CollaboratorError::Files(format!("No folder {}", folder_id)))?;
        folder.files.push(file.clone());
        drop(folder);
        Ok(self.next_id("file"))
    }
}

// ============================================================================
// MAIL
// ============================================================================

pub struct InMemoryMailer {
    sent: Mutex<Vec<MailMessage>>,
    fail: AtomicBool,
}

impl InMemoryMailer {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }

    pub fn sent(&self) -> Vec<MailMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl Default for InMemoryMailer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MailSender for InMemoryMailer {
    async fn send(&self, message: &MailMessage) -> Result<(), CollaboratorError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Mail("quota exceeded".to_string()));
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}
