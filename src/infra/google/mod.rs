// =============================================================================
// GOOGLE WORKSPACE MODULE
// =============================================================================
//
// Implementations of the request ports on top of Google's REST APIs:
// - `sheets_client.rs`: data table and template access, PDF export
// - `drive_client.rs`: output folder and PDF storage
// - `gmail_client.rs`: mail delivery
// - `service_account.rs`: OAuth2 tokens shared by all three
//
// This lives in the infra layer because it handles external I/O. The core only
// knows about cells, files and messages.

pub mod drive_client;
pub mod gmail_client;
pub mod service_account;
pub mod sheets_client;

pub use drive_client::GoogleDriveClient;
pub use gmail_client::GmailClient;
pub use service_account::ServiceAccountAuth;
pub use sheets_client::GoogleSheetsClient;
