pub mod format;
pub mod frame;
pub mod queue;

pub use format::{FrameFormat, MbusCode, PixelFormat};
pub use frame::{BufferState, DoneFrame, VideoBuffer};
pub use queue::{queue_setup, CaptureMode, VideoQueue};
