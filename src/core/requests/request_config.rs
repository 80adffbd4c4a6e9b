// Explicit configuration for the row processor.
// Built once at startup (see `main.rs`) and handed to the service; nothing in
// the core reads the environment directly.

use chrono::format::{Item, StrftimeItems};
use chrono_tz::Tz;
use std::time::Duration;
use thiserror::Error;

use super::request_models::PdfLayout;
use super::template::{CellAddress, CellMapping, TokenTable};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required setting {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Where the form data lives inside the data table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnLayout {
    pub timestamp_column: u32,
    pub first_data_column: u32,
    pub data_field_count: u32,
    pub status_column: u32,
    /// How many data fields get a `{{Colum<letter>}}` token.
    pub token_field_count: usize,
}

impl Default for ColumnLayout {
    fn default() -> Self {
        Self {
            timestamp_column: 1,
            first_data_column: 3,
            data_field_count: 38,
            status_column: 40,
            token_field_count: 36,
        }
    }
}

/// How row values get into the template.
#[derive(Debug, Clone)]
pub enum TemplateFill {
    Tokens(TokenTable),
    Cells(Vec<CellMapping>),
}

impl TemplateFill {
    pub fn tokens_for(layout: &ColumnLayout) -> Self {
        TemplateFill::Tokens(TokenTable::columns(
            layout.first_data_column,
            layout.token_field_count,
        ))
    }
}

/// Which sheet gets filled and rendered.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateMode {
    /// Fill and render a disposable duplicate of the template, then delete it.
    ScratchCopy,
    /// Fill the template itself.
    Shared {
        /// Write the pre-fill snapshot back after the export attempt. Without it
        /// the template keeps the last request's values.
        restore: bool,
        /// Cell read and rewritten before export to force a re-render.
        refresh_cell: Option<CellAddress>,
    },
}

/// When the processed marker is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkPolicy {
    /// Only after the mailer reported success.
    ConfirmedSend,
    /// After the send call returned, whatever its result.
    SendAttempted,
}

#[derive(Debug, Clone)]
pub struct MailSettings {
    pub override_enabled: bool,
    pub override_recipients: Vec<String>,
    pub sender_name: String,
    pub subject: String,
    pub body: String,
}

impl Default for MailSettings {
    fn default() -> Self {
        Self {
            override_enabled: false,
            override_recipients: Vec::new(),
            sender_name: "Generate and send PDFs".to_string(),
            subject: "Component Request Notification".to_string(),
            body: "Hello!\r\nPlease see the attached PDF document.".to_string(),
        }
    }
}

impl MailSettings {
    /// Override list when override mode is on, otherwise the row's own address.
    pub fn recipients_for(&self, row_recipient: &str) -> Vec<String> {
        if self.override_enabled {
            self.override_recipients.clone()
        } else {
            vec![row_recipient.trim().to_string()]
        }
    }
}

/// Everything the row processor needs to know.
#[derive(Debug, Clone)]
pub struct RequestConfig {
    pub data_sheet: String,
    pub template_sheet: String,
    pub output_folder: String,
    pub layout: ColumnLayout,
    pub fill: TemplateFill,
    pub template_mode: TemplateMode,
    pub settle_delay: Duration,
    pub pdf_layout: PdfLayout,
    pub mail: MailSettings,
    pub mark_policy: MarkPolicy,
    pub date_format: String,
    pub timezone: Tz,
    pub missing_value: String,
}

impl Default for RequestConfig {
    fn default() -> Self {
        let layout = ColumnLayout::default();
        Self {
            data_sheet: "Form Responses 1".to_string(),
            template_sheet: "Request Template".to_string(),
            output_folder: "Component Requests PDFs".to_string(),
            fill: TemplateFill::tokens_for(&layout),
            layout,
            template_mode: TemplateMode::ScratchCopy,
            settle_delay: Duration::ZERO,
            pdf_layout: PdfLayout::default(),
            mail: MailSettings::default(),
            mark_policy: MarkPolicy::ConfirmedSend,
            date_format: "%d/%m/%Y".to_string(),
            timezone: chrono_tz::UTC,
            missing_value: "N/A".to_string(),
        }
    }
}

impl RequestConfig {
    /// Catches combinations that would only fail halfway through a request.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_sheet.is_empty() {
            return Err(ConfigError::Missing("DATA_SHEET_NAME"));
        }
        if self.template_sheet.is_empty() {
            return Err(ConfigError::Missing("REQUEST_TEMPLATE_SHEET_NAME"));
        }
        if self.output_folder.is_empty() {
            return Err(ConfigError::Missing("OUTPUT_FOLDER_NAME"));
        }
        if self.mail.override_enabled && self.mail.override_recipients.is_empty() {
            return Err(ConfigError::Invalid {
                key: "EMAIL_ADDRESS_OVERRIDE",
                reason: "override is enabled but the list is empty".to_string(),
            });
        }
        if self.layout.data_field_count < 3 {
            return Err(ConfigError::Invalid {
                key: "data_field_count",
                reason: "at least the three required fields must be read".to_string(),
            });
        }
        validate_date_format(&self.date_format)?;
        Ok(())
    }
}

/// chrono panics when displaying a malformed pattern, so reject it up front.
pub fn validate_date_format(format: &str) -> Result<(), ConfigError> {
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(ConfigError::Invalid {
            key: "DATE_FORMAT",
            reason: format!("'{}' is not a valid strftime pattern", format),
        });
    }
    Ok(())
}
