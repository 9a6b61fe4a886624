pub mod debounce;
pub mod demux;
pub mod history;
pub mod score;
pub mod session;
pub mod snapshots;
pub mod supervisor;

pub use debounce::{DebounceState, Edge, MotionDebouncer};
pub use demux::FrameDemuxer;
pub use history::{FrameHistory, FramePair};
pub use score::{FrameScorer, MotionScorer};
pub use session::{SessionError, SessionStatus, StreamSession};
pub use snapshots::{SnapshotEntry, SnapshotStore};
pub use supervisor::{
    DecoderCommand, DecoderOutput, ProcessSupervisor, SupervisorError, SupervisorState,
};
