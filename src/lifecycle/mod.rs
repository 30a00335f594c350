//! Process lifecycle: shutdown coordination and signal handling.

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::shutdown_signal;
