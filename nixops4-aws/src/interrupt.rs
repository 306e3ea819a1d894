use anyhow::{Context, Result};
use nixops4_aws_engine::InterruptState;

fn set_process_interrupt_handler(interrupted: &InterruptState) -> Result<()> {
    let interrupted = interrupted.clone();
    ctrlc::set_handler(move || {
        if !interrupted.is_interrupted() {
            eprintln!("interrupted; waiting for running operations to finish");
        }
        interrupted.set_interrupted();
    })
    .context("Error setting interrupt handler")
}

/// Route Ctrl-C to a fresh [`InterruptState`]. No new resource is started
/// once it is set; calls already in flight finish and are recorded.
pub fn set_up_process_interrupt_handler() -> Result<InterruptState> {
    let interrupt_state = InterruptState::new();
    set_process_interrupt_handler(&interrupt_state)?;
    Ok(interrupt_state)
}
