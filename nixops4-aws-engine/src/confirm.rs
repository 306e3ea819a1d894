/// Asks the user before destructive operations.
pub trait ConfirmCallback: Send {
    /// `Ok(true)` to go ahead.
    fn confirm(&mut self, prompt: &str) -> std::io::Result<bool>;
}

/// Answers every question with yes.
pub struct AutoConfirm;

impl ConfirmCallback for AutoConfirm {
    fn confirm(&mut self, _prompt: &str) -> std::io::Result<bool> {
        Ok(true)
    }
}

/// Answers every question with no.
pub struct AutoDecline;

impl ConfirmCallback for AutoDecline {
    fn confirm(&mut self, _prompt: &str) -> std::io::Result<bool> {
        Ok(false)
    }
}
