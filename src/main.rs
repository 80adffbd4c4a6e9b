// This is the entry point of the form request mailer.
//
// **Architecture Overview:**
// - `core/` = Business logic (platform-agnostic): the row processor, template
//   filling, the request queue
// - `infra/` = Implementations of core traits (Google Sheets, Drive, Gmail)
//
// This file's job is to:
// 1. Load configuration from the environment (and `.env`)
// 2. Initialize the Google clients and the processor (dependency injection)
// 3. Start the request worker
// 4. Poll the data table for new or edited rows until Ctrl-C

#[path = "core/core_layer.rs"]
mod core;
#[path = "infra/infra_layer.rs"]
mod infra;

use anyhow::{anyhow, Context};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::core::requests::template::default_cell_map;
use crate::core::requests::{
    Backpressure, CellAddress, CellMapping, ConfigError, MarkPolicy, PaperSize, QueueSettings,
    RequestConfig, RequestQueue, RowProcessor, RowWatcher, TemplateFill, TemplateMode,
};
use crate::infra::google::{
    GmailClient, GoogleDriveClient, GoogleSheetsClient, ServiceAccountAuth,
};

type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Trimmed, non-empty value of a setting.
fn setting(lookup: Lookup, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn flag(lookup: Lookup, key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match setting(lookup, key) {
        None => Ok(default),
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key,
                reason: format!("'{}' is not a boolean", value),
            }),
        },
    }
}

fn number<T>(lookup: Lookup, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match setting(lookup, key) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
        }),
    }
}

fn load_field_map(path: &str) -> Result<Vec<CellMapping>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Invalid {
        key: "FIELD_MAP_FILE",
        reason: format!("{}: {}", path, e),
    })?;
    serde_json::from_str(&text).map_err(|e| ConfigError::Invalid {
        key: "FIELD_MAP_FILE",
        reason: e.to_string(),
    })
}

fn paper_size(value: &str) -> Result<PaperSize, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "letter" => Ok(PaperSize::Letter),
        "legal" => Ok(PaperSize::Legal),
        "a3" => Ok(PaperSize::A3),
        "a4" => Ok(PaperSize::A4),
        "a5" => Ok(PaperSize::A5),
        other => Err(ConfigError::Invalid {
            key: "PDF_PAPER_SIZE",
            reason: format!("unknown paper size '{}'", other),
        }),
    }
}

/// Builds the processor configuration; unset settings keep their defaults.
fn load_request_config(lookup: Lookup) -> Result<RequestConfig, ConfigError> {
    let mut config = RequestConfig::default();

    if let Some(v) = setting(lookup, "DATA_SHEET_NAME") {
        config.data_sheet = v;
    }
    if let Some(v) = setting(lookup, "REQUEST_TEMPLATE_SHEET_NAME") {
        config.template_sheet = v;
    }
    if let Some(v) = setting(lookup, "OUTPUT_FOLDER_NAME") {
        config.output_folder = v;
    }

    // Mail
    config.mail.override_enabled = flag(lookup, "EMAIL_OVERRIDE", false)?;
    config.mail.override_recipients = setting(lookup, "EMAIL_ADDRESS_OVERRIDE")
        .map(|list| {
            list.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();
    if let Some(v) = setting(lookup, "APP_TITLE") {
        config.mail.sender_name = v;
    }
    if let Some(v) = setting(lookup, "EMAIL_SUBJECT") {
        config.mail.subject = v;
    }
    if let Some(v) = setting(lookup, "EMAIL_BODY") {
        config.mail.body = v.replace("\\n", "\r\n");
    }

    // Template
    config.fill = match setting(lookup, "TEMPLATE_FILL").as_deref() {
        None | Some("tokens") => TemplateFill::tokens_for(&config.layout),
        Some("cells") => TemplateFill::Cells(match setting(lookup, "FIELD_MAP_FILE") {
            Some(path) => load_field_map(&path)?,
            None => default_cell_map(),
        }),
        Some(other) => {
            return Err(ConfigError::Invalid {
                key: "TEMPLATE_FILL",
                reason: format!("expected 'tokens' or 'cells', got '{}'", other),
            })
        }
    };

    config.template_mode = match setting(lookup, "TEMPLATE_MODE").as_deref() {
        None | Some("scratch") => TemplateMode::ScratchCopy,
        Some("shared") => {
            // Present but empty disables the refresh.
            let refresh_cell = match lookup("TEMPLATE_REFRESH_CELL") {
                None => Some(CellAddress::new(1, 1)),
                Some(v) if v.trim().is_empty() => None,
                Some(v) => Some(v.parse::<CellAddress>().map_err(|e| ConfigError::Invalid {
                    key: "TEMPLATE_REFRESH_CELL",
                    reason: format!("{}", e),
                })?),
            };
            TemplateMode::Shared {
                restore: flag(lookup, "TEMPLATE_RESTORE", true)?,
                refresh_cell,
            }
        }
        Some(other) => {
            return Err(ConfigError::Invalid {
                key: "TEMPLATE_MODE",
                reason: format!("expected 'scratch' or 'shared', got '{}'", other),
            })
        }
    };
    config.settle_delay = Duration::from_secs(number(lookup, "RENDER_SETTLE_SECS", 0u64)?);

    if let Some(v) = setting(lookup, "PDF_PAPER_SIZE") {
        config.pdf_layout.paper = paper_size(&v)?;
    }
    config.pdf_layout.portrait = flag(lookup, "PDF_PORTRAIT", config.pdf_layout.portrait)?;

    config.mark_policy = match setting(lookup, "MARK_POLICY").as_deref() {
        None | Some("confirmed") => MarkPolicy::ConfirmedSend,
        Some("attempted") => MarkPolicy::SendAttempted,
        Some(other) => {
            return Err(ConfigError::Invalid {
                key: "MARK_POLICY",
                reason: format!("expected 'confirmed' or 'attempted', got '{}'", other),
            })
        }
    };

    if let Some(v) = setting(lookup, "DATE_FORMAT") {
        config.date_format = v;
    }
    if let Some(v) = setting(lookup, "SPREADSHEET_TIMEZONE") {
        config.timezone = v.parse::<chrono_tz::Tz>().map_err(|e| ConfigError::Invalid {
            key: "SPREADSHEET_TIMEZONE",
            reason: format!("{}", e),
        })?;
    }
    if let Some(v) = lookup("MISSING_VALUE_TEXT") {
        config.missing_value = v;
    }

    config.validate()?;
    Ok(config)
}

fn load_queue_settings(lookup: Lookup) -> Result<QueueSettings, ConfigError> {
    let capacity: usize = number(lookup, "QUEUE_CAPACITY", 32)?;
    if capacity == 0 {
        return Err(ConfigError::Invalid {
            key: "QUEUE_CAPACITY",
            reason: "must be at least 1".to_string(),
        });
    }

    let wait: u64 = number(lookup, "QUEUE_WAIT_SECS", 10)?;
    let backpressure = if wait == 0 {
        Backpressure::Reject
    } else {
        Backpressure::Wait(Duration::from_secs(wait))
    };

    Ok(QueueSettings {
        capacity,
        backpressure,
    })
}

fn load_poll_interval(lookup: Lookup) -> Result<Duration, ConfigError> {
    let secs: u64 = number(lookup, "POLL_INTERVAL_SECS", 60)?;
    if secs == 0 {
        return Err(ConfigError::Invalid {
            key: "POLL_INTERVAL_SECS",
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

// ============================================================================
// POLLING
// ============================================================================

async fn poll_once(watcher: &RowWatcher<GoogleSheetsClient>, queue: &RequestQueue) {
    let events = match watcher.poll().await {
        Ok(events) => events,
        Err(e) => {
            tracing::warn!("Polling the data table failed: {}", e);
            return;
        }
    };

    if !events.is_empty() {
        tracing::info!("Found {} new or changed row(s)", events.len());
    }
    for event in events {
        if let Err(e) = queue.dispatch(&event).await {
            tracing::warn!(row = event.row, "Could not queue row, retrying next poll: {}", e);
            watcher.forget(event.row);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging so we can see what's happening
    tracing_subscriber::fmt::init();

    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();

    let lookup = |key: &str| std::env::var(key).ok();
    let config = load_request_config(&lookup).context("Invalid configuration")?;
    let queue_settings = load_queue_settings(&lookup).context("Invalid configuration")?;
    let poll_interval = load_poll_interval(&lookup).context("Invalid configuration")?;

    let spreadsheet = std::env::var("SPREADSHEET_ID")
        .context("Missing SPREADSHEET_ID environment variable! Add it to your .env file.")?;
    let spreadsheet_id = GoogleSheetsClient::extract_spreadsheet_id(&spreadsheet)
        .ok_or_else(|| anyhow!("Could not extract a spreadsheet ID from: {}", spreadsheet))?;

    // ========================================================================
    // DEPENDENCY INJECTION
    // ========================================================================

    let auth = Arc::new(
        ServiceAccountAuth::from_env()
            .await
            .map_err(|e| anyhow!("Failed to load Google credentials: {}", e))?,
    );
    if auth.subject().is_none() {
        tracing::warn!("GOOGLE_IMPERSONATE_USER is not set; Gmail will refuse to send");
    }

    let sheets = Arc::new(GoogleSheetsClient::new(Arc::clone(&auth), spreadsheet_id));
    let drive = Arc::new(GoogleDriveClient::new(Arc::clone(&auth)));
    let gmail = Arc::new(GmailClient::new(Arc::clone(&auth)));

    let data_sheet = config.data_sheet.clone();
    let status_column = config.layout.status_column;
    tracing::info!(
        data_sheet = %data_sheet,
        template = %config.template_sheet,
        override_enabled = config.mail.override_enabled,
        "Starting form request mailer"
    );

    let processor = Arc::new(RowProcessor::new(
        Arc::clone(&sheets),
        Arc::clone(&sheets),
        drive,
        gmail,
        config,
    ));
    let (queue, worker) = RequestQueue::start(processor, data_sheet.clone(), queue_settings);
    let watcher = RowWatcher::new(Arc::clone(&sheets), data_sheet, status_column);

    let mut ticker = tokio::time::interval(poll_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => poll_once(&watcher, &queue).await,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down, finishing queued rows");
                break;
            }
        }
    }

    drop(queue);
    worker.await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::requests::template::FieldSource;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let lookup = env(&[]);
        let config = load_request_config(&lookup).unwrap();

        assert_eq!(config.data_sheet, "Form Responses 1");
        assert_eq!(config.template_mode, TemplateMode::ScratchCopy);
        assert!(matches!(config.fill, TemplateFill::Tokens(_)));
        assert!(!config.mail.override_enabled);

        let queue = load_queue_settings(&lookup).unwrap();
        assert_eq!(queue.capacity, 32);
        assert_eq!(queue.backpressure, Backpressure::Wait(Duration::from_secs(10)));
        assert_eq!(load_poll_interval(&lookup).unwrap(), Duration::from_secs(60));
    }

    #[test]
    fn override_and_shared_mode_settings() {
        let lookup = env(&[
            ("EMAIL_OVERRIDE", "true"),
            ("EMAIL_ADDRESS_OVERRIDE", "ops@x.com, qa@x.com,"),
            ("TEMPLATE_MODE", "shared"),
            ("TEMPLATE_RESTORE", "false"),
            ("TEMPLATE_REFRESH_CELL", ""),
            ("MARK_POLICY", "attempted"),
            ("SPREADSHEET_TIMEZONE", "America/Sao_Paulo"),
            ("PDF_PAPER_SIZE", "letter"),
        ]);
        let config = load_request_config(&lookup).unwrap();

        assert_eq!(
            config.mail.override_recipients,
            vec!["ops@x.com".to_string(), "qa@x.com".to_string()]
        );
        assert_eq!(
            config.template_mode,
            TemplateMode::Shared {
                restore: false,
                refresh_cell: None
            }
        );
        assert_eq!(config.mark_policy, MarkPolicy::SendAttempted);
        assert_eq!(config.timezone, chrono_tz::America::Sao_Paulo);
        assert_eq!(config.pdf_layout.paper, PaperSize::Letter);
    }

    #[test]
    fn shared_mode_refreshes_a1_unless_told_otherwise() {
        let lookup = env(&[("TEMPLATE_MODE", "shared")]);
        let config = load_request_config(&lookup).unwrap();

        assert_eq!(
            config.template_mode,
            TemplateMode::Shared {
                restore: true,
                refresh_cell: Some(CellAddress::new(1, 1))
            }
        );
    }

    #[test]
    fn rejects_bad_values() {
        assert!(load_request_config(&env(&[("EMAIL_OVERRIDE", "maybe")])).is_err());
        assert!(load_request_config(&env(&[("TEMPLATE_MODE", "copy")])).is_err());
        assert!(load_request_config(&env(&[("SPREADSHEET_TIMEZONE", "Mars/Base")])).is_err());
        assert!(load_request_config(&env(&[("EMAIL_OVERRIDE", "true")])).is_err());
        assert!(load_queue_settings(&env(&[("QUEUE_CAPACITY", "0")])).is_err());
        assert!(load_poll_interval(&env(&[("POLL_INTERVAL_SECS", "soon")])).is_err());
    }

    #[test]
    fn zero_wait_means_reject() {
        let queue = load_queue_settings(&env(&[("QUEUE_WAIT_SECS", "0")])).unwrap();
        assert_eq!(queue.backpressure, Backpressure::Reject);
    }

    #[test]
    fn cell_fill_reads_the_field_map_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"cell":"C4","source":"date"}},{{"cell":"C5","source":{{"field":2}}}}]"#
        )
        .unwrap();
        let path = file.path().to_string_lossy().to_string();

        let lookup = env(&[("TEMPLATE_FILL", "cells"), ("FIELD_MAP_FILE", path.as_str())]);
        let config = load_request_config(&lookup).unwrap();

        let TemplateFill::Cells(map) = config.fill else {
            panic!("expected a cell map");
        };
        assert_eq!(map.len(), 2);
        assert_eq!(map[1].cell, CellAddress::new(3, 5));
        assert_eq!(map[1].source, FieldSource::Field(2));
    }

    #[test]
    fn cell_fill_defaults_to_column_b() {
        let config = load_request_config(&env(&[("TEMPLATE_FILL", "cells")])).unwrap();
        let TemplateFill::Cells(map) = config.fill else {
            panic!("expected a cell map");
        };
        assert_eq!(map.len(), 36);
    }
}
