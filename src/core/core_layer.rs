// The core module contains all business logic.
// Each feature gets its own submodule.

#[path = "requests/mod.rs"]
pub mod requests;
