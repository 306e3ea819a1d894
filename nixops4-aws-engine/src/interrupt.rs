use std::{
    error::Error,
    fmt::Display,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// Shared flag set when the user asks to stop.
///
/// The engine only looks at it between resources and between handlers, so a
/// provider call that has started is always allowed to finish.
#[derive(Clone, Debug, Default)]
pub struct InterruptState {
    interrupted: Arc<AtomicBool>,
}

#[derive(Clone, Debug)]
pub struct InterruptedError {}
impl Display for InterruptedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "interrupted")
    }
}
impl Error for InterruptedError {}

impl InterruptState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_interrupted(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub fn check_interrupted(&self) -> Result<(), InterruptedError> {
        if self.is_interrupted() {
            Err(InterruptedError {})
        } else {
            Ok(())
        }
    }
}
