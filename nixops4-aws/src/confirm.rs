use nixops4_aws_engine::ConfirmCallback;
use std::io::{self, BufRead, Write};

/// Asks on the terminal. Anything but `y` or `yes` declines, including the
/// end of input.
pub(crate) struct PromptConfirm<R, W> {
    input: R,
    output: W,
}

impl PromptConfirm<io::BufReader<io::Stdin>, io::Stderr> {
    pub(crate) fn stdio() -> Self {
        PromptConfirm::new(io::BufReader::new(io::stdin()), io::stderr())
    }
}

impl<R: BufRead + Send, W: Write + Send> PromptConfirm<R, W> {
    pub(crate) fn new(input: R, output: W) -> Self {
        PromptConfirm { input, output }
    }
}

impl<R: BufRead + Send, W: Write + Send> ConfirmCallback for PromptConfirm<R, W> {
    fn confirm(&mut self, prompt: &str) -> io::Result<bool> {
        write!(self.output, "{} [y/N] ", prompt)?;
        self.output.flush()?;
        let mut answer = String::new();
        self.input.read_line(&mut answer)?;
        Ok(matches!(
            answer.trim().to_ascii_lowercase().as_str(),
            "y" | "yes"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ask(input: &str) -> (bool, String) {
        let mut output = Vec::new();
        let answer = PromptConfirm::new(input.as_bytes(), &mut output)
            .confirm("Destroy `db`?")
            .unwrap();
        (answer, String::from_utf8(output).unwrap())
    }

    #[test]
    fn answers() {
        assert_eq!(ask("y\n"), (true, "Destroy `db`? [y/N] ".to_owned()));
        assert!(ask(" YES \n").0);
        assert!(!ask("n\n").0);
        assert!(!ask("\n").0);
        assert!(!ask("").0);
        assert!(!ask("yep\n").0);
    }
}
