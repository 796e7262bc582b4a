//! Operator confirmation for destructive or rate-limited actions.

use std::io::{BufRead, IsTerminal, Write};

pub trait Confirm: Send + Sync {
    /// Ask a yes/no question. Anything but an explicit yes is a no.
    fn confirm(&self, question: &str) -> bool;
}

/// Prompts on the terminal. Without a terminal the answer is no,
/// unless `assume_yes` is set.
pub struct StdinConfirm {
    pub assume_yes: bool,
}

impl Confirm for StdinConfirm {
    fn confirm(&self, question: &str) -> bool {
        if self.assume_yes {
            return true;
        }
        if !std::io::stdin().is_terminal() {
            return false;
        }
        print!("{} [y/N] ", question);
        if std::io::stdout().flush().is_err() {
            return false;
        }
        let mut answer = String::new();
        if std::io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        is_yes(&answer)
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
