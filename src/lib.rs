pub use cv_calib3d as calib3d;
pub use cv_core as core;
pub use cv_imgproc as imgproc;
pub use cv_optimize as optimize;
pub use cv_stitching as stitching;
pub use cv_video as video;

pub mod session;
pub use session::{SessionConfig, SessionError};

/// Initialize the global Rayon thread pool used by every per-row image loop.
///
/// Call once at startup. Repeated calls return the first outcome.
///
/// Priority order:
/// 1. explicit `num_threads`
/// 2. `GTCV_CPU_THREADS` env var
/// 3. Rayon default
pub fn init_thread_pool(num_threads: Option<usize>) -> cv_core::Result<()> {
    cv_core::init_global_thread_pool(num_threads)
}
