pub mod local;
pub mod remote;
pub mod session;

pub use local::{LocalOrchestrator, TrainingHandle};
pub use remote::{
    post_result_with_retry, RemoteOrchestrator, SessionRunner, SessionTransport, ThrottledBridge,
    CANCEL_CHECK_EVERY_M_BATCHES, PROGRESS_EVERY_N_BATCHES, RESULT_POST_MAX_RETRIES,
};
pub use session::{JobLoadMode, SessionState, SessionStatus, TrainingJobRequest};
