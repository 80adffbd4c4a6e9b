// In-memory collaborators for exercising the request workflow without Google.

pub mod in_memory;

pub use in_memory::{InMemoryDrive, InMemoryMailer, InMemorySpreadsheet};
