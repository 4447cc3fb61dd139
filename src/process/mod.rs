//! Subprocess lifecycle management: spawning under PTY or pipe, line
//! scanning, and signal-based termination.

pub mod pty;
pub mod scanner;
pub mod signal;
pub mod supervisor;

pub use scanner::{LineScannerConfig, LineCallback, LineFilter, LineProcessor};
pub use signal::{signal_name, NativeSignalBackend, SignalBackend};
pub use supervisor::{Supervisor, SupervisorOptions, GRACEFUL_SHUTDOWN_TIMEOUT};
