// Form request workflow: one spreadsheet row in, one mailed PDF out.

pub mod request_config;
pub mod request_models;
pub mod request_ports;
pub mod request_queue;
pub mod request_service;
pub mod row_watcher;
pub mod template;

pub use request_config::{
    ColumnLayout, ConfigError, MailSettings, MarkPolicy, RequestConfig, TemplateFill,
    TemplateMode,
};
pub use request_models::{EditEvent, PaperSize, PdfLayout, RowOutcome};
pub use request_queue::{Backpressure, QueueSettings, RequestQueue};
pub use request_service::RowProcessor;
pub use row_watcher::RowWatcher;
pub use template::{CellAddress, CellMapping};
