// The row processor: turns one form submission into a mailed PDF.
// This module has no Google-specific code. It talks to the spreadsheet, the
// renderer, the file store and the mailer only through the traits in
// `request_ports.rs`, so the whole protocol runs against in-memory fakes in tests.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::request_config::{MarkPolicy, RequestConfig, TemplateFill, TemplateMode};
use super::request_models::{
    CellValue, FileBlob, FormRow, Grid, MailMessage, RowOutcome, SheetId, PROCESSED_MARKER,
};
use super::request_ports::{CollaboratorError, DocumentRenderer, FileStore, MailSender, TabularStore};
use super::request_queue::RowHandler;
use super::template::{
    cell_writes, fill_tokens, format_timestamp, CellAddress, CellRange, TemplateError,
    TemplateValues,
};

/// Indexes (into the data fields) that must be present: request id, recipient
/// email and part number.
pub const REQUIRED_FIELDS: [usize; 3] = [0, 1, 2];

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("No recipients for row {0}")]
    NoRecipients(u32),

    #[error("Processing of row {0} aborted: {1}")]
    Aborted(u32, String),
}

/// Processes single rows of the data table.
///
/// Callers must not run two `process_row` calls against the same template at
/// once; `RequestQueue` provides that guarantee.
pub struct RowProcessor<T, R, F, M>
where
    T: TabularStore,
    R: DocumentRenderer,
    F: FileStore,
    M: MailSender,
{
    tabular: Arc<T>,
    renderer: Arc<R>,
    files: Arc<F>,
    mailer: Arc<M>,
    config: RequestConfig,
}

impl<T, R, F, M> RowProcessor<T, R, F, M>
where
    T: TabularStore,
    R: DocumentRenderer,
    F: FileStore,
    M: MailSender,
{
    pub fn new(
        tabular: Arc<T>,
        renderer: Arc<R>,
        files: Arc<F>,
        mailer: Arc<M>,
        config: RequestConfig,
    ) -> Self {
        Self {
            tabular,
            renderer,
            files,
            mailer,
            config,
        }
    }

    /// Runs the full protocol for one row.
    ///
    /// Errors leave the status cell untouched so a later edit can retry the row.
    pub async fn process_row(&self, row: u32) -> Result<RowOutcome, ProcessError> {
        let (form, status) = self.read_row(row).await?;

        if matches!(&status, CellValue::Text(text) if text == PROCESSED_MARKER) {
            debug!(row, "Row already processed, skipping");
            return Ok(RowOutcome::AlreadyProcessed);
        }

        let missing: Vec<usize> = REQUIRED_FIELDS
            .iter()
            .copied()
            .filter(|index| form.field(*index).is_blank())
            .collect();
        if !missing.is_empty() {
            warn!(row, ?missing, "Missing required data in row");
            return Ok(RowOutcome::MissingRequired { fields: missing });
        }

        let recipients = self.config.mail.recipients_for(&form.recipient());
        if recipients.iter().all(|r| r.is_empty()) {
            return Err(ProcessError::NoRecipients(row));
        }

        let date = format_timestamp(
            &form.timestamp,
            &self.config.date_format,
            self.config.timezone,
        )?;
        let values = TemplateValues {
            date,
            fields: form.fields.clone(),
        };

        let pdf_name = format!("Request-{}", form.request_id());
        let pdf = self.render_request(row, &values).await?;
        let blob = FileBlob::pdf(format!("{}.pdf", pdf_name), pdf);

        let folder_id = self.output_folder().await?;
        let file_id = self.files.create_file(&folder_id, &blob).await?;
        debug!(row, %file_id, "Stored {}", blob.name);

        let message = MailMessage {
            to: recipients.clone(),
            subject: self.config.mail.subject.clone(),
            body: self.config.mail.body.clone(),
            sender_name: self.config.mail.sender_name.clone(),
            attachments: vec![blob],
        };

        let mail_sent = match self.mailer.send(&message).await {
            Ok(()) => true,
            Err(err) if self.config.mark_policy == MarkPolicy::SendAttempted => {
                warn!(row, "Mail send failed, marking row anyway: {}", err);
                false
            }
            Err(err) => return Err(err.into()),
        };

        self.tabular
            .write_cell(
                &self.config.data_sheet,
                CellAddress::new(self.config.layout.status_column, row),
                CellValue::from(PROCESSED_MARKER),
            )
            .await?;

        info!(
            row,
            pdf_name = %pdf_name,
            recipients = recipients.len(),
            mail_sent,
            "Request processed"
        );

        Ok(RowOutcome::Processed {
            pdf_name,
            file_id,
            recipients,
            mail_sent,
        })
    }

    /// Reads the whole row once and splits it into the form data and the status.
    async fn read_row(&self, row: u32) -> Result<(FormRow, CellValue), ProcessError> {
        let layout = &self.config.layout;
        let last_field = layout.first_data_column + layout.data_field_count - 1;
        let width = layout
            .timestamp_column
            .max(last_field)
            .max(layout.status_column);

        let grid = self
            .tabular
            .read_range(
                &self.config.data_sheet,
                CellRange::new(CellAddress::new(1, row), 1, width),
            )
            .await?;
        let cells = grid.into_iter().next().unwrap_or_default();
        let at = |column: u32| {
            cells
                .get(column as usize - 1)
                .cloned()
                .unwrap_or_default()
        };

        let form = FormRow {
            row,
            timestamp: at(layout.timestamp_column),
            fields: (layout.first_data_column..=last_field).map(at).collect(),
        };
        Ok((form, at(layout.status_column)))
    }

    /// Fills a template sheet and exports it, honouring the template mode.
    async fn render_request(
        &self,
        row: u32,
        values: &TemplateValues,
    ) -> Result<Vec<u8>, ProcessError> {
        let template = &self.config.template_sheet;

        match &self.config.template_mode {
            TemplateMode::ScratchCopy => {
                let scratch = scratch_sheet_name(template, row);
                let sheet_id = self.tabular.duplicate_sheet(template, &scratch).await?;
                debug!(row, sheet_id, "Created scratch sheet '{}'", scratch);

                let rendered = self.fill_and_export(&scratch, sheet_id, values, None).await;

                if let Err(err) = self.tabular.delete_sheet(sheet_id).await {
                    warn!(row, sheet_id, "Failed to delete scratch sheet: {}", err);
                }
                rendered
            }
            TemplateMode::Shared {
                restore,
                refresh_cell,
            } => {
                let snapshot = if *restore {
                    Some(self.tabular.read_used_range(template).await?)
                } else {
                    None
                };
                let sheet_id = self.tabular.sheet_id(template).await?;

                let rendered = self
                    .fill_and_export(template, sheet_id, values, *refresh_cell)
                    .await;

                if let Some(snapshot) = snapshot {
                    let (range, grid) = self.restore_block(snapshot);
                    if let Err(err) = self.tabular.write_range(template, range, grid).await {
                        warn!(row, "Failed to restore template: {}", err);
                    }
                }
                rendered
            }
        }
    }

    async fn fill_and_export(
        &self,
        sheet: &str,
        sheet_id: SheetId,
        values: &TemplateValues,
        refresh_cell: Option<CellAddress>,
    ) -> Result<Vec<u8>, ProcessError> {
        match &self.config.fill {
            TemplateFill::Tokens(tokens) => {
                let template = self.tabular.read_used_range(sheet).await?;
                let filled = fill_tokens(&template, tokens, values, &self.config.missing_value);
                if filled != template {
                    self.tabular
                        .write_range(sheet, CellRange::covering(&filled), filled)
                        .await?;
                }
            }
            TemplateFill::Cells(map) => {
                self.tabular
                    .write_cells(sheet, cell_writes(map, values))
                    .await?;
            }
        }

        if let Some(cell) = refresh_cell {
            let current = self.tabular.read_cell(sheet, cell).await?;
            self.tabular.write_cell(sheet, cell, current).await?;
        }

        if !self.config.settle_delay.is_zero() {
            tokio::time::sleep(self.config.settle_delay).await;
        }

        Ok(self
            .renderer
            .render_pdf(sheet_id, &self.config.pdf_layout)
            .await?)
    }

    /// Grows the snapshot so that writing it back also clears mapped cells that
    /// lie outside the template's original used range.
    fn restore_block(&self, snapshot: Grid) -> (CellRange, Grid) {
        let mut rows = snapshot.len();
        let mut columns = snapshot.iter().map(Vec::len).max().unwrap_or(0);

        if let TemplateFill::Cells(map) = &self.config.fill {
            for mapping in map {
                rows = rows.max(mapping.cell.row as usize);
                columns = columns.max(mapping.cell.column as usize);
            }
        }

        let mut grid = snapshot;
        grid.resize_with(rows.max(1), Vec::new);
        for line in grid.iter_mut() {
            line.resize(columns.max(1), CellValue::Empty);
        }
        (CellRange::covering(&grid), grid)
    }

    /// First folder with the configured name, or a new one.
    async fn output_folder(&self) -> Result<String, ProcessError> {
        let name = &self.config.output_folder;
        let existing = self.files.find_folders(name).await?;
        if existing.len() > 1 {
            debug!("{} folders named '{}', using the first", existing.len(), name);
        }

        match existing.into_iter().next() {
            Some(id) => Ok(id),
            None => {
                info!("Creating output folder '{}'", name);
                Ok(self.files.create_folder(name).await?)
            }
        }
    }
}

#[async_trait]
impl<T, R, F, M> RowHandler for RowProcessor<T, R, F, M>
where
    T: TabularStore + 'static,
    R: DocumentRenderer + 'static,
    F: FileStore + 'static,
    M: MailSender + 'static,
{
    async fn handle_row(&self, row: u32) -> Result<RowOutcome, ProcessError> {
        self.process_row(row).await
    }
}

fn scratch_sheet_name(template: &str, row: u32) -> String {
    format!(
        "{} (row {} {:06x})",
        template,
        row,
        rand::random::<u32>() & 0x00ff_ffff
    )
}
