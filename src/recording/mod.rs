//! Recording module for workout sessions and FIT export.

pub mod actor;
pub mod exporter_fit;
pub mod recorder;
pub mod session;
pub mod types;

pub use actor::{spawn_session_task, SessionCommand, SessionHandle};
pub use exporter_fit::{encode, encode_with, suggested_filename, write_activity_file};
pub use recorder::SessionRecorder;
pub use session::WorkoutSession;
pub use types::{
    ExportConfig, ExportError, IngestOutcome, PauseInterval, SessionConfig, SessionError,
    SessionRecord, SessionState, SessionStatus, SessionSummary,
};
