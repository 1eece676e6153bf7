//! SQLite-backed durable state for the proxy.
//!
//! One process owns the database. Sessions and their turn-by-turn history
//! are the orchestrator's concern; the task, edit-history, and test-run
//! tables back the corresponding workspace tools.

mod model;
mod schema;
mod store;

pub use model::EditRecord;
pub use model::SessionRecord;
pub use model::TaskRecord;
pub use model::TestRunRecord;
pub use store::SessionStore;
