// Google Sheets client: cell access through the Sheets v4 REST API and PDF export
// through the spreadsheet export endpoint.

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::service_account::{expect_success, ServiceAccountAuth};
use crate::core::requests::request_models::{CellValue, Grid, PaperSize, PdfLayout, SheetId};
use crate::core::requests::request_ports::{CollaboratorError, DocumentRenderer, TabularStore};
use crate::core::requests::template::{CellAddress, CellRange};

const SHEETS_API: &str = "https://sheets.googleapis.com";
const EXPORT_BASE: &str = "https://docs.google.com";

// =============================================================================
// API RESPONSE STRUCTURES
// =============================================================================

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Debug, Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SheetProperties {
    sheet_id: SheetId,
    title: String,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct BatchUpdateResponse {
    #[serde(default)]
    replies: Vec<Value>,
}

// =============================================================================
// CLIENT
// =============================================================================

/// One spreadsheet, accessed as the service account.
pub struct GoogleSheetsClient {
    client: Client,
    auth: Arc<ServiceAccountAuth>,
    spreadsheet_id: String,
    /// Sheet title -> sheet id, filled lazily from spreadsheet metadata.
    sheet_ids: DashMap<String, SheetId>,
}

impl GoogleSheetsClient {
    pub fn new(auth: Arc<ServiceAccountAuth>, spreadsheet_id: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            auth,
            spreadsheet_id: spreadsheet_id.into(),
            sheet_ids: DashMap::new(),
        }
    }

    /// Extracts the spreadsheet ID from a Google Sheets URL, or passes a bare ID through.
    pub fn extract_spreadsheet_id(url_or_id: &str) -> Option<String> {
        let url_or_id = url_or_id.trim();
        if url_or_id.contains("docs.google.com") {
            let start = url_or_id.find("/spreadsheets/d/")?;
            let after_d = &url_or_id[start + 16..];
            let end = after_d.find('/').unwrap_or(after_d.len());
            let id = &after_d[..end];
            return (!id.is_empty()).then(|| id.to_string());
        }
        if !url_or_id.is_empty() && !url_or_id.contains('/') && !url_or_id.contains(' ') {
            return Some(url_or_id.to_string());
        }
        None
    }

    fn api_url(&self, suffix: &str) -> String {
        format!(
            "{}/v4/spreadsheets/{}{}",
            SHEETS_API, self.spreadsheet_id, suffix
        )
    }

    /// `values/{range}` URL with the range percent-encoded as one path segment.
    fn values_url(&self, range: &str) -> Result<Url, CollaboratorError> {
        let mut url = Url::parse(&self.api_url("/values"))
            .map_err(|e| CollaboratorError::Tabular(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| CollaboratorError::Tabular("Cannot build values URL".to_string()))?
            .push(range);
        Ok(url)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: Url,
        query: &[(&str, &str)],
    ) -> Result<T, CollaboratorError> {
        let token = self.auth.access_token().await?;
        let response = self
            .client
            .get(url)
            .query(query)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| CollaboratorError::Tabular(e.to_string()))?;
        let response = expect_success(response, "Sheets API error")
            .await
            .map_err(CollaboratorError::Tabular)?;

        response
            .json()
            .await
            .map_err(|e| CollaboratorError::Tabular(e.to_string()))
    }

    async fn send_json(
        &self,
        method: reqwest::Method,
        url: Url,
        query: &[(&str, &str)],
        body: Value,
    ) -> Result<Value, CollaboratorError> {
        let token = self.auth.access_token().await?;
        let response = self
            .client
            .request(method, url)
            .query(query)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| CollaboratorError::Tabular(e.to_string()))?;
        let response = expect_success(response, "Sheets API error")
            .await
            .map_err(CollaboratorError::Tabular)?;

        response
            .json()
            .await
            .map_err(|e| CollaboratorError::Tabular(e.to_string()))
    }

    async fn batch_update(&self, requests: Value) -> Result<BatchUpdateResponse, CollaboratorError> {
        let url = Url::parse(&self.api_url(":batchUpdate"))
            .map_err(|e| CollaboratorError::Tabular(e.to_string()))?;
        let reply = self
            .send_json(reqwest::Method::POST, url, &[], json!({ "requests": requests }))
            .await?;
        serde_json::from_value(reply).map_err(|e| CollaboratorError::Tabular(e.to_string()))
    }

    async fn refresh_sheet_ids(&self) -> Result<(), CollaboratorError> {
        let url = Url::parse(&self.api_url(""))
            .map_err(|e| CollaboratorError::Tabular(e.to_string()))?;
        let meta: SpreadsheetMeta = self
            .get_json(url, &[("fields", "sheets.properties(sheetId,title)")])
            .await?;

        self.sheet_ids.clear();
        for sheet in meta.sheets {
            self.sheet_ids
                .insert(sheet.properties.title, sheet.properties.sheet_id);
        }
        Ok(())
    }

    async fn read_values(
        &self,
        range: &str,
        render: &str,
    ) -> Result<Vec<Vec<Value>>, CollaboratorError> {
        let url = self.values_url(range)?;
        let values: ValueRange = self
            .get_json(
                url,
                &[
                    ("majorDimension", "ROWS"),
                    ("valueRenderOption", render),
                    ("dateTimeRenderOption", "SERIAL_NUMBER"),
                ],
            )
            .await?;
        Ok(values.values)
    }
}

/// `'Sheet name'!B10:C12`
pub fn a1_range(sheet: &str, range: &CellRange) -> String {
    format!("{}!{}", quote_sheet(sheet), range.to_a1())
}

fn quote_sheet(sheet: &str) -> String {
    format!("'{}'", sheet.replace('\'', "''"))
}

fn cell_from_json(value: &Value) -> CellValue {
    match value {
        Value::Null => CellValue::Empty,
        Value::String(text) => CellValue::from(text.as_str()),
        Value::Number(n) => CellValue::Number(n.as_f64().unwrap_or_default()),
        Value::Bool(b) => CellValue::Bool(*b),
        other => CellValue::Text(other.to_string()),
    }
}

fn cell_to_json(value: &CellValue) -> Value {
    match value {
        CellValue::Empty => json!(""),
        CellValue::Text(text) => json!(text),
        CellValue::Number(n) => json!(n),
        CellValue::Bool(b) => json!(b),
    }
}

fn grid_to_json(grid: &Grid) -> Value {
    Value::Array(
        grid.iter()
            .map(|row| Value::Array(row.iter().map(cell_to_json).collect()))
            .collect(),
    )
}

/// The values API drops trailing empty rows and cells; put them back.
fn to_grid(values: Vec<Vec<Value>>, rows: usize, columns: usize) -> Grid {
    let mut grid: Grid = values
        .iter()
        .map(|row| row.iter().map(cell_from_json).collect())
        .collect();
    grid.resize_with(rows.max(grid.len()), Vec::new);
    for row in grid.iter_mut() {
        row.resize(columns.max(row.len()), CellValue::Empty);
    }
    grid
}

/// Query parameters understood by the spreadsheet PDF export endpoint.
pub fn export_query(layout: &PdfLayout, sheet_id: SheetId) -> Vec<(&'static str, String)> {
    let flag = |on: bool| on.to_string();
    let size = match layout.paper {
        PaperSize::Letter => "letter",
        PaperSize::Legal => "legal",
        PaperSize::A3 => "A3",
        PaperSize::A4 => "A4",
        PaperSize::A5 => "A5",
    };
    let [top, bottom, left, right] = layout.margins;

    vec![
        ("format", "pdf".to_string()),
        ("size", size.to_string()),
        ("portrait", flag(layout.portrait)),
        ("fitw", flag(layout.fit_to_width)),
        ("gridlines", flag(layout.gridlines)),
        ("printtitle", flag(layout.print_title)),
        ("sheetnames", flag(layout.sheet_names)),
        (
            "pagenum",
            if layout.page_numbers { "CENTER" } else { "UNDEFINED" }.to_string(),
        ),
        ("fzr", flag(layout.repeat_frozen_rows)),
        ("top_margin", top.to_string()),
        ("bottom_margin", bottom.to_string()),
        ("left_margin", left.to_string()),
        ("right_margin", right.to_string()),
        ("attachment", "true".to_string()),
        ("gid", sheet_id.to_string()),
    ]
}

#[async_trait]
impl TabularStore for GoogleSheetsClient {
    async fn sheet_id(&self, sheet: &str) -> Result<SheetId, CollaboratorError> {
        if let Some(id) = self.sheet_ids.get(sheet) {
            return Ok(*id);
        }

        self.refresh_sheet_ids().await?;
        self.sheet_ids
            .get(sheet)
            .map(|id| *id)
            .ok_or_else(|| CollaboratorError::SheetNotFound(sheet.to_string()))
    }

    async fn read_range(&self, sheet: &str, range: CellRange) -> Result<Grid, CollaboratorError> {
        let values = self
            .read_values(&a1_range(sheet, &range), "UNFORMATTED_VALUE")
            .await?;
        let mut grid = to_grid(values, range.rows as usize, range.columns as usize);
        grid.truncate(range.rows as usize);
        Ok(grid)
    }

    /// Formulas come back as their source text so a write-back keeps them.
    async fn read_used_range(&self, sheet: &str) -> Result<Grid, CollaboratorError> {
        let values = self.read_values(&quote_sheet(sheet), "FORMULA").await?;
        let columns = values.iter().map(Vec::len).max().unwrap_or(0);
        let rows = values.len();
        Ok(to_grid(values, rows, columns))
    }

    async fn write_range(
        &self,
        sheet: &str,
        range: CellRange,
        values: Grid,
    ) -> Result<(), CollaboratorError> {
        let a1 = a1_range(sheet, &range);
        let url = self.values_url(&a1)?;
        self.send_json(
            reqwest::Method::PUT,
            url,
            &[("valueInputOption", "USER_ENTERED")],
            json!({
                "range": a1,
                "majorDimension": "ROWS",
                "values": grid_to_json(&values),
            }),
        )
        .await?;
        Ok(())
    }

    async fn write_cells(
        &self,
        sheet: &str,
        cells: Vec<(CellAddress, CellValue)>,
    ) -> Result<(), CollaboratorError> {
        if cells.is_empty() {
            return Ok(());
        }

        let data: Vec<Value> = cells
            .iter()
            .map(|(address, value)| {
                json!({
                    "range": a1_range(sheet, &CellRange::single(*address)),
                    "values": [[cell_to_json(value)]],
                })
            })
            .collect();

        let url = Url::parse(&self.api_url("/values:batchUpdate"))
            .map_err(|e| CollaboratorError::Tabular(e.to_string()))?;
        self.send_json(
            reqwest::Method::POST,
            url,
            &[],
            json!({ "valueInputOption": "USER_ENTERED", "data": data }),
        )
        .await?;
        Ok(())
    }

    async fn row_count(&self, sheet: &str) -> Result<u32, CollaboratorError> {
        let values = self
            .read_values(&quote_sheet(sheet), "UNFORMATTED_VALUE")
            .await?;
        Ok(values.len() as u32)
    }

    async fn duplicate_sheet(
        &self,
        sheet: &str,
        new_name: &str,
    ) -> Result<SheetId, CollaboratorError> {
        let source = self.sheet_id(sheet).await?;
        let reply = self
            .batch_update(json!([{
                "duplicateSheet": {
                    "sourceSheetId": source,
                    "newSheetName": new_name,
                }
            }]))
            .await?;

        let new_id = reply
            .replies
            .first()
            .and_then(|r| r.pointer("/duplicateSheet/properties/sheetId"))
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                CollaboratorError::Tabular("duplicateSheet reply had no sheet id".to_string())
            })?;

        self.sheet_ids.insert(new_name.to_string(), new_id);
        Ok(new_id)
    }

    async fn delete_sheet(&self, sheet_id: SheetId) -> Result<(), CollaboratorError> {
        self.batch_update(json!([{ "deleteSheet": { "sheetId": sheet_id } }]))
            .await?;
        self.sheet_ids.retain(|_, id| *id != sheet_id);
        Ok(())
    }
}

#[async_trait]
impl DocumentRenderer for GoogleSheetsClient {
    async fn render_pdf(
        &self,
        sheet_id: SheetId,
        layout: &PdfLayout,
    ) -> Result<Vec<u8>, CollaboratorError> {
        let url = format!(
            "{}/spreadsheets/d/{}/export",
            EXPORT_BASE, self.spreadsheet_id
        );
        let token = self.auth.access_token().await?;

        tracing::debug!(sheet_id, "Exporting sheet as PDF");

        let response = self
            .client
            .get(&url)
            .query(&export_query(layout, sheet_id))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| CollaboratorError::Render(e.to_string()))?;
        let response = expect_success(response, "PDF export failed")
            .await
            .map_err(CollaboratorError::Render)?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| CollaboratorError::Render(e.to_string()))?;

        // A login or error page comes back as 200 text/html.
        if !bytes.starts_with(b"%PDF") {
            return Err(CollaboratorError::Render(
                "Export did not return a PDF. Is the spreadsheet shared with the service account?"
                    .to_string(),
            ));
        }
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_spreadsheet_id_from_url() {
        let url = "https://docs.google.com/spreadsheets/d/1abc123xyz/edit#gid=0";
        assert_eq!(
            GoogleSheetsClient::extract_spreadsheet_id(url),
            Some("1abc123xyz".to_string())
        );
        assert_eq!(
            GoogleSheetsClient::extract_spreadsheet_id("1abc123xyz"),
            Some("1abc123xyz".to_string())
        );
        assert_eq!(GoogleSheetsClient::extract_spreadsheet_id("not an id"), None);
    }

    #[test]
    fn quotes_sheet_names_in_ranges() {
        let range = CellRange::new(CellAddress::new(3, 5), 1, 38);
        assert_eq!(a1_range("Form Responses 1", &range), "'Form Responses 1'!C5:AN5");
        assert_eq!(quote_sheet("Bob's"), "'Bob''s'");
    }

    #[test]
    fn pads_ragged_value_ranges() {
        let values = vec![vec![json!("a"), json!(2.0)], vec![json!(true)]];
        let grid = to_grid(values, 3, 3);

        assert_eq!(grid.len(), 3);
        assert!(grid.iter().all(|row| row.len() == 3));
        assert_eq!(grid[0][1], CellValue::Number(2.0));
        assert_eq!(grid[1][0], CellValue::Bool(true));
        assert_eq!(grid[2][2], CellValue::Empty);
    }

    #[test]
    fn empty_strings_read_as_empty_cells() {
        assert_eq!(cell_from_json(&json!("")), CellValue::Empty);
        assert_eq!(cell_to_json(&CellValue::Empty), json!(""));
    }

    #[test]
    fn export_query_carries_layout() {
        let query = export_query(&PdfLayout::default(), 42);
        let get = |key: &str| {
            query
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.clone())
                .unwrap()
        };

        assert_eq!(get("format"), "pdf");
        assert_eq!(get("size"), "A4");
        assert_eq!(get("gridlines"), "false");
        assert_eq!(get("fitw"), "true");
        assert_eq!(get("top_margin"), "0.5");
        assert_eq!(get("bottom_margin"), "0.25");
        assert_eq!(get("pagenum"), "UNDEFINED");
        assert_eq!(get("gid"), "42");
    }

    #[test]
    fn values_url_encodes_the_range() {
        let auth = Arc::new(
            ServiceAccountAuth::from_json(
                r#"{"client_email":"a@b","private_key":"k","token_uri":"https://t"}"#,
                None,
            )
            .unwrap(),
        );
        let client = GoogleSheetsClient::new(auth, "sheet123");

        let url = client.values_url("'Form Responses 1'!A1:B2").unwrap();
        assert!(url
            .as_str()
            .starts_with("https://sheets.googleapis.com/v4/spreadsheets/sheet123/values/"));
        assert!(!url.as_str().contains(' '));
    }
}
