// Template filling.
//
// Two ways to put a row into the template sheet:
// - token substitution: `{{Date}}` / `{{ColumC}}` style placeholders inside cell text
// - a declarative field map: fixed cell addresses that receive a date or field value
//
// Everything here is pure so it can be tested without any spreadsheet behind it.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::request_models::{CellValue, Grid};

#[derive(Debug, Error, PartialEq)]
pub enum TemplateError {
    #[error("Invalid cell address: {0}")]
    InvalidAddress(String),

    #[error("Unrecognized timestamp: {0}")]
    InvalidTimestamp(String),
}

// ============================================================================
// A1 ADDRESSING
// ============================================================================

/// Converts a 1-based column number into its letter name (1 -> A, 27 -> AA).
pub fn column_letter(mut column: u32) -> String {
    let mut letters = Vec::new();
    while column > 0 {
        let rem = ((column - 1) % 26) as u8;
        letters.push((b'A' + rem) as char);
        column = (column - 1) / 26;
    }
    letters.iter().rev().collect()
}

/// Converts a column letter name into its 1-based number.
pub fn column_number(letters: &str) -> Option<u32> {
    if letters.is_empty() {
        return None;
    }
    letters.chars().try_fold(0u32, |acc, c| {
        if !c.is_ascii_alphabetic() {
            return None;
        }
        let digit = c.to_ascii_uppercase() as u32 - 'A' as u32 + 1;
        acc.checked_mul(26)?.checked_add(digit)
    })
}

/// A single cell in A1 notation. Both coordinates are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CellAddress {
    pub column: u32,
    pub row: u32,
}

impl CellAddress {
    pub fn new(column: u32, row: u32) -> Self {
        Self { column, row }
    }
}

impl fmt::Display for CellAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", column_letter(self.column), self.row)
    }
}

impl FromStr for CellAddress {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let split = trimmed
            .find(|c: char| c.is_ascii_digit())
            .ok_or_else(|| TemplateError::InvalidAddress(s.to_string()))?;
        let (letters, digits) = trimmed.split_at(split);

        let column =
            column_number(letters).ok_or_else(|| TemplateError::InvalidAddress(s.to_string()))?;
        let row: u32 = digits
            .parse()
            .map_err(|_| TemplateError::InvalidAddress(s.to_string()))?;
        if row == 0 {
            return Err(TemplateError::InvalidAddress(s.to_string()));
        }

        Ok(Self { column, row })
    }
}

impl TryFrom<String> for CellAddress {
    type Error = TemplateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CellAddress> for String {
    fn from(value: CellAddress) -> Self {
        value.to_string()
    }
}

/// A rectangular block of cells anchored at `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRange {
    pub start: CellAddress,
    pub rows: u32,
    pub columns: u32,
}

impl CellRange {
    pub fn new(start: CellAddress, rows: u32, columns: u32) -> Self {
        Self {
            start,
            rows,
            columns,
        }
    }

    pub fn single(cell: CellAddress) -> Self {
        Self::new(cell, 1, 1)
    }

    /// Range covering a whole grid written from A1.
    pub fn covering(grid: &Grid) -> Self {
        let rows = grid.len() as u32;
        let columns = grid.iter().map(Vec::len).max().unwrap_or(0) as u32;
        Self::new(CellAddress::new(1, 1), rows.max(1), columns.max(1))
    }

    pub fn end(&self) -> CellAddress {
        CellAddress::new(
            self.start.column + self.columns.saturating_sub(1),
            self.start.row + self.rows.saturating_sub(1),
        )
    }

    /// A1 notation, e.g. `C5:AN5`, or just `B10` for a single cell.
    pub fn to_a1(&self) -> String {
        if self.rows <= 1 && self.columns <= 1 {
            self.start.to_string()
        } else {
            format!("{}:{}", self.start, self.end())
        }
    }
}

// ============================================================================
// FIELD SOURCES
// ============================================================================

/// Where a template slot takes its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSource {
    /// The formatted submission date.
    Date,
    /// A data field by zero-based index (0 = first data column).
    Field(usize),
}

/// Stringified row values the template is filled with.
#[derive(Debug, Clone)]
pub struct TemplateValues {
    pub date: String,
    pub fields: Vec<CellValue>,
}

impl TemplateValues {
    pub fn cell(&self, source: FieldSource) -> CellValue {
        match source {
            FieldSource::Date => CellValue::from(self.date.as_str()),
            FieldSource::Field(index) => self.fields.get(index).cloned().unwrap_or_default(),
        }
    }

    /// Text used for token substitution; blanks become `missing`.
    pub fn text(&self, source: FieldSource, missing: &str) -> String {
        let value = self.cell(source);
        if value.is_blank() {
            missing.to_string()
        } else {
            value.to_string()
        }
    }
}

// ============================================================================
// TOKEN SUBSTITUTION
// ============================================================================

/// The recognized `{{Name}}` placeholders.
#[derive(Debug, Clone, Default)]
pub struct TokenTable {
    tokens: HashMap<String, FieldSource>,
}

impl TokenTable {
    /// `{{Date}}` plus one `{{Colum<letter>}}` token per data field, named after
    /// the column the field lives in.
    pub fn columns(first_data_column: u32, count: usize) -> Self {
        let mut tokens = HashMap::with_capacity(count + 1);
        tokens.insert("Date".to_string(), FieldSource::Date);
        for index in 0..count {
            let letter = column_letter(first_data_column + index as u32);
            tokens.insert(format!("Colum{}", letter), FieldSource::Field(index));
        }
        Self { tokens }
    }

    pub fn lookup(&self, name: &str) -> Option<FieldSource> {
        self.tokens.get(name).copied()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }
}

/// Replaces every known `{{Name}}` in `text` in a single left-to-right pass.
///
/// Substituted values are never rescanned, and anything that is not a complete
/// known token is copied through untouched. Returns `None` when nothing matched.
pub fn substitute_tokens<F>(text: &str, resolve: F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut output = String::with_capacity(text.len());
    let mut rest = text;
    let mut changed = false;

    while let Some(open) = rest.find("{{") {
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            break;
        };

        let name = &after_open[..close];
        match resolve(name) {
            Some(value) => {
                output.push_str(&rest[..open]);
                output.push_str(&value);
                rest = &after_open[close + 2..];
                changed = true;
            }
            None => {
                // Keep the braces and look for the next opener right after them.
                output.push_str(&rest[..open + 2]);
                rest = after_open;
            }
        }
    }

    if !changed {
        return None;
    }
    output.push_str(rest);
    Some(output)
}

/// Produces a filled copy of the template grid. Only text cells can carry
/// tokens; every other cell is returned as-is.
pub fn fill_tokens(
    template: &Grid,
    tokens: &TokenTable,
    values: &TemplateValues,
    missing: &str,
) -> Grid {
    template
        .iter()
        .map(|row| {
            row.iter()
                .map(|cell| {
                    let Some(text) = cell.as_text() else {
                        return cell.clone();
                    };
                    let filled = substitute_tokens(text, |name| {
                        tokens
                            .lookup(name)
                            .map(|source| values.text(source, missing))
                    });
                    filled.map(CellValue::Text).unwrap_or_else(|| cell.clone())
                })
                .collect()
        })
        .collect()
}

// ============================================================================
// FIXED CELL MAP
// ============================================================================

/// One entry of the declarative field-mapping table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellMapping {
    pub cell: CellAddress,
    pub source: FieldSource,
}

/// The stock layout: data fields 0..36 written down column B from row 10.
pub fn default_cell_map() -> Vec<CellMapping> {
    (0..36)
        .map(|index| CellMapping {
            cell: CellAddress::new(2, 10 + index as u32),
            source: FieldSource::Field(index),
        })
        .collect()
}

pub fn cell_writes(map: &[CellMapping], values: &TemplateValues) -> Vec<(CellAddress, CellValue)> {
    map.iter()
        .map(|mapping| (mapping.cell, values.cell(mapping.source)))
        .collect()
}

// ============================================================================
// DATES
// ============================================================================

/// Day zero of spreadsheet serial dates.
fn serial_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1899, 12, 30)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

/// Serial of 9999-12-31, the last day spreadsheets can display.
const MAX_SERIAL: f64 = 2_958_465.0;

const TEXT_DATETIME_FORMATS: &[&str] = &[
    "%m/%d/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

const TEXT_DATE_FORMATS: &[&str] = &["%m/%d/%Y", "%d/%m/%Y", "%Y-%m-%d"];

/// Reads a timestamp cell as wall-clock time in the spreadsheet's zone.
pub fn parse_timestamp(value: &CellValue, tz: Tz) -> Result<NaiveDateTime, TemplateError> {
    match value {
        CellValue::Number(serial)
            if serial.is_finite() && (0.0..=MAX_SERIAL).contains(serial) =>
        {
            let millis = (serial * 86_400_000.0).round() as i64;
            Duration::try_milliseconds(millis)
                .and_then(|offset| serial_epoch().checked_add_signed(offset))
                .ok_or_else(|| TemplateError::InvalidTimestamp(serial.to_string()))
        }
        CellValue::Text(text) => {
            let text = text.trim();
            if let Ok(instant) = DateTime::parse_from_rfc3339(text) {
                return Ok(tz.from_utc_datetime(&instant.naive_utc()).naive_local());
            }
            for format in TEXT_DATETIME_FORMATS {
                if let Ok(parsed) = NaiveDateTime::parse_from_str(text, format) {
                    return Ok(parsed);
                }
            }
            for format in TEXT_DATE_FORMATS {
                if let Ok(parsed) = NaiveDate::parse_from_str(text, format) {
                    return Ok(parsed.and_hms_opt(0, 0, 0).unwrap_or_default());
                }
            }
            Err(TemplateError::InvalidTimestamp(text.to_string()))
        }
        other => Err(TemplateError::InvalidTimestamp(other.to_string())),
    }
}

/// Formats a timestamp cell with a validated strftime pattern.
pub fn format_timestamp(value: &CellValue, format: &str, tz: Tz) -> Result<String, TemplateError> {
    Ok(parse_timestamp(value, tz)?.format(format).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(fields: &[&str]) -> TemplateValues {
        TemplateValues {
            date: "09/11/2024".to_string(),
            fields: fields.iter().map(|f| CellValue::from(*f)).collect(),
        }
    }

    fn text_grid(rows: &[&[&str]]) -> Grid {
        rows.iter()
            .map(|row| row.iter().map(|c| CellValue::from(*c)).collect())
            .collect()
    }

    #[test]
    fn column_letters_round_trip_edges() {
        assert_eq!(column_letter(1), "A");
        assert_eq!(column_letter(26), "Z");
        assert_eq!(column_letter(27), "AA");
        assert_eq!(column_letter(38), "AL");
        assert_eq!(column_number("AN"), Some(40));
        assert_eq!(column_number("a"), Some(1));
        assert_eq!(column_number("A1"), None);
    }

    #[test]
    fn parses_a1_addresses() {
        assert_eq!("B10".parse::<CellAddress>(), Ok(CellAddress::new(2, 10)));
        assert_eq!("ab3".parse::<CellAddress>(), Ok(CellAddress::new(28, 3)));
        assert!("10".parse::<CellAddress>().is_err());
        assert!("B0".parse::<CellAddress>().is_err());
        assert!("B".parse::<CellAddress>().is_err());
    }

    #[test]
    fn ranges_render_in_a1() {
        let row = CellRange::new(CellAddress::new(3, 5), 1, 38);
        assert_eq!(row.to_a1(), "C5:AN5");
        assert_eq!(CellRange::single(CellAddress::new(40, 2)).to_a1(), "AN2");
    }

    #[test]
    fn token_table_names_fields_by_column() {
        let table = TokenTable::columns(3, 36);
        assert_eq!(table.len(), 37);
        assert_eq!(table.lookup("ColumC"), Some(FieldSource::Field(0)));
        assert_eq!(table.lookup("ColumAL"), Some(FieldSource::Field(35)));
        assert_eq!(table.lookup("ColumAM"), None);
        assert_eq!(table.lookup("Date"), Some(FieldSource::Date));
    }

    #[test]
    fn substitutes_every_occurrence() {
        let table = TokenTable::columns(3, 36);
        let template = text_grid(&[&["{{ColumC}} / {{ColumC}}", "Date: {{Date}}"]]);
        let filled = fill_tokens(&template, &table, &values(&["REQ-100"]), "N/A");

        assert_eq!(filled[0][0], CellValue::from("REQ-100 / REQ-100"));
        assert_eq!(filled[0][1], CellValue::from("Date: 09/11/2024"));
    }

    #[test]
    fn leaves_partial_and_unknown_tokens_alone() {
        let table = TokenTable::columns(3, 36);
        let template = text_grid(&[&[
            "{{ColumC",
            "{{ ColumC }}",
            "{{ColumZZ}}",
            "{Date}",
            "plain text",
            "",
        ]]);
        let filled = fill_tokens(&template, &table, &values(&["REQ-1"]), "N/A");

        assert_eq!(filled, template);
    }

    #[test]
    fn substituted_values_are_not_rescanned() {
        let table = TokenTable::columns(3, 36);
        let template = text_grid(&[&["{{ColumC}}"]]);
        let filled = fill_tokens(&template, &table, &values(&["{{ColumD}}", "x"]), "N/A");

        assert_eq!(filled[0][0], CellValue::from("{{ColumD}}"));
    }

    #[test]
    fn blank_fields_become_missing_text() {
        let table = TokenTable::columns(3, 36);
        let template = text_grid(&[&["Notes: {{ColumF}}"]]);
        let filled = fill_tokens(&template, &table, &values(&["a", "b", "c"]), "N/A");

        assert_eq!(filled[0][0], CellValue::from("Notes: N/A"));
    }

    #[test]
    fn non_text_cells_pass_through() {
        let table = TokenTable::columns(3, 36);
        let template = vec![vec![CellValue::Number(7.0), CellValue::Empty]];
        let filled = fill_tokens(&template, &table, &values(&["a"]), "N/A");

        assert_eq!(filled, template);
    }

    #[test]
    fn adjacent_tokens_with_stray_braces() {
        let table = TokenTable::columns(3, 36);
        let out = substitute_tokens("{{{{ColumC}}}}", |name| {
            table.lookup(name).map(|_| "X".to_string())
        });
        assert_eq!(out.as_deref(), Some("{{X}}"));
    }

    #[test]
    fn default_cell_map_walks_column_b() {
        let map = default_cell_map();
        assert_eq!(map.len(), 36);
        assert_eq!(map[0].cell.to_string(), "B10");
        assert_eq!(map[35].cell.to_string(), "B45");
        assert_eq!(map[35].source, FieldSource::Field(35));

        let writes = cell_writes(&map[..2], &values(&["REQ-9", "a@x.com"]));
        assert_eq!(writes[1], (CellAddress::new(2, 11), CellValue::from("a@x.com")));
    }

    #[test]
    fn cell_mapping_json_uses_a1_strings() {
        let json = r#"[{"cell":"B9","source":"date"},{"cell":"B10","source":{"field":0}}]"#;
        let map: Vec<CellMapping> = serde_json::from_str(json).unwrap();
        assert_eq!(map[0].source, FieldSource::Date);
        assert_eq!(map[1].cell, CellAddress::new(2, 10));
    }

    #[test]
    fn formats_serial_dates() {
        // 45605.5 = 2024-11-09 12:00
        let formatted =
            format_timestamp(&CellValue::Number(45605.5), "%d/%m/%Y", chrono_tz::UTC).unwrap();
        assert_eq!(formatted, "09/11/2024");
    }

    #[test]
    fn formats_text_timestamps() {
        let tz: Tz = "America/Sao_Paulo".parse().unwrap();
        let form = CellValue::from("11/9/2024 14:03:22");
        assert_eq!(format_timestamp(&form, "%d/%m/%Y", tz).unwrap(), "09/11/2024");

        // 01:00 UTC is still the previous evening in Sao Paulo.
        let instant = CellValue::from("2024-11-10T01:00:00Z");
        assert_eq!(format_timestamp(&instant, "%d/%m/%Y", tz).unwrap(), "09/11/2024");
    }

    #[test]
    fn rejects_unreadable_timestamps() {
        assert!(format_timestamp(&CellValue::from("yesterday"), "%d/%m/%Y", chrono_tz::UTC).is_err());
        assert!(format_timestamp(&CellValue::Empty, "%d/%m/%Y", chrono_tz::UTC).is_err());
    }

    #[test]
    fn out_of_range_serials_are_errors() {
        for serial in [1.0e12, 2_958_466.0, f64::MAX, -1.0] {
            assert!(matches!(
                parse_timestamp(&CellValue::Number(serial), chrono_tz::UTC),
                Err(TemplateError::InvalidTimestamp(_))
            ));
        }
        assert_eq!(
            format_timestamp(&CellValue::Number(2_958_465.0), "%Y-%m-%d", chrono_tz::UTC).unwrap(),
            "9999-12-31"
        );
    }
}
