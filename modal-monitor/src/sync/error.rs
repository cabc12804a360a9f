use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorError {
    /// The calling thread does not own the monitor of the object.
    IllegalMonitorState,
    /// The thread was interrupted while waiting.
    Interrupted,
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorError::IllegalMonitorState => {
                write!(f, "current thread is not the owner of the monitor")
            }
            MonitorError::Interrupted => write!(f, "thread interrupted while waiting"),
        }
    }
}

impl std::error::Error for MonitorError {}

pub type MonitorResult<T = ()> = Result<T, MonitorError>;
