use std::fmt;

/// Errors that can occur while serving an owoTrack device.
#[derive(Debug, thiserror::Error)]
pub enum OwoError {
    #[error("Socket error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Malformed {kind} packet: {reason}")]
    Protocol { kind: &'static str, reason: String },

    #[error("UDP port {0} is already in use")]
    PortUnavailable(u16),

    #[error("Handler is not initialized")]
    NotInitialized,

    #[error("A calibration is already in progress")]
    CalibrationPending,

    #[error("Failed to spawn worker thread: {0}")]
    WorkerSpawn(String),
}

impl OwoError {
    /// Map a bind failure, singling out port conflicts.
    pub(crate) fn from_bind(err: std::io::Error, port: u16) -> Self {
        match err.kind() {
            std::io::ErrorKind::AddrInUse => OwoError::PortUnavailable(port),
            _ => OwoError::Transport(err),
        }
    }
}

/// Thread-safe last-error storage for the C FFI layer.
pub(crate) struct LastError {
    message: std::sync::Mutex<String>,
}

impl LastError {
    pub const fn new() -> Self {
        Self {
            message: std::sync::Mutex::new(String::new()),
        }
    }

    pub fn set(&self, err: &OwoError) {
        if let Ok(mut msg) = self.message.lock() {
            *msg = fmt::format(format_args!("{}\0", err));
        }
    }

    pub fn as_ptr(&self) -> *const std::ffi::c_char {
        match self.message.lock() {
            Ok(msg) if !msg.is_empty() => msg.as_ptr() as *const std::ffi::c_char,
            _ => std::ptr::null(),
        }
    }
}
