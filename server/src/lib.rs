//! HTTP surface of the overpass proxy: route table, session-id binding,
//! and SSE emission. The interesting work happens in `overpass-core`; this
//! crate stays thin.

mod router;
mod session_id;

pub use router::AppState;
pub use router::build_router;
pub use session_id::resolve_session_id;
