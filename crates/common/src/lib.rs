pub mod protocol;
pub mod models;
pub mod snapshot;
pub mod diff;
pub mod heartbeat;
pub mod crypto;

pub use protocol::{
    ClientMessage, ServerMessage, ConnectionAck, EventKind,
    encode_message, decode_message, frame_message, frame_len, FrameError,
    PROTOCOL_VERSION, MAX_MESSAGE_SIZE,
    STATUS_OK, STATUS_BAD_REQUEST, STATUS_UNAUTHORIZED,
};

pub use models::{
    ProjectStatus, FileNode, ProjectSnapshot, Command, PackageOperation,
    PackageSpec, ProjectInfo, ProjectPayload, ProjectManifest, ManifestError,
};

pub use snapshot::{scan, client_exclusions, SnapshotError, DEPENDENCY_CACHE_DIR, DEPENDENCY_LOCK_FILE};
pub use diff::{diff, bootstrap, DiffResult, RemovedEntry};
pub use heartbeat::reconcile;
