//! Transport-agnostic operations. API routes and the CLI call these; each
//! one becomes a command for the session loop.

pub mod session;
pub mod squad;
pub mod voice;
