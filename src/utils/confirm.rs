// pgphase/src/utils/confirm.rs
use std::fmt;
use std::io::{BufRead, Write};

use crate::errors::{AppError, Result};

/// What a destructive action is about to do, rendered for a human.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionSummary {
    pub action: String,
    pub source: String,
    pub destination: String,
    pub storage_key: String,
}

impl fmt::Display for ActionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  Action      : {}", self.action)?;
        writeln!(f, "  Source      : {}", self.source)?;
        writeln!(f, "  Destination : {}", self.destination)?;
        write!(f, "  Storage key : {}", self.storage_key)
    }
}

/// Capability to ask for an explicit go-ahead.
pub trait ConfirmationProvider: Send + Sync {
    fn confirm(&self, summary: &ActionSummary) -> Result<bool>;
}

/// Used with `--force`.
pub struct AutoConfirm;

impl ConfirmationProvider for AutoConfirm {
    fn confirm(&self, summary: &ActionSummary) -> Result<bool> {
        tracing::info!("Auto-confirmed (--force): {}", summary.action);
        Ok(true)
    }
}

/// Prompts on stdout and reads the answer from stdin.
pub struct StdinConfirmation;

impl ConfirmationProvider for StdinConfirmation {
    fn confirm(&self, summary: &ActionSummary) -> Result<bool> {
        let stdin = std::io::stdin();
        let stdout = std::io::stdout();
        ask(summary, &mut stdin.lock(), &mut stdout.lock())
    }
}

fn ask(summary: &ActionSummary, input: &mut impl BufRead, output: &mut impl Write) -> Result<bool> {
    writeln!(output, "⚠️  About to perform a destructive action:")?;
    writeln!(output, "{}", summary)?;
    write!(output, "Type 'yes' to continue: ")?;
    output.flush()?;

    let mut answer = String::new();
    input.read_line(&mut answer)?;
    Ok(is_affirmative(&answer))
}

fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Asks `provider` and turns a refusal into [`AppError::Cancelled`].
pub fn require_confirmation(
    provider: &dyn ConfirmationProvider,
    summary: &ActionSummary,
) -> Result<()> {
    if provider.confirm(summary)? {
        Ok(())
    } else {
        Err(AppError::Cancelled(format!("'{}' was not confirmed", summary.action)))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Answers with a fixed value and remembers what it was asked.
    pub struct FixedAnswer {
        answer: bool,
        pub asked: Mutex<Vec<ActionSummary>>,
    }

    impl FixedAnswer {
        pub fn yes() -> Self {
            FixedAnswer { answer: true, asked: Mutex::new(Vec::new()) }
        }

        pub fn no() -> Self {
            FixedAnswer { answer: false, asked: Mutex::new(Vec::new()) }
        }

        pub fn times_asked(&self) -> usize {
            self.asked.lock().unwrap().len()
        }
    }

    impl ConfirmationProvider for FixedAnswer {
        fn confirm(&self, summary: &ActionSummary) -> Result<bool> {
            self.asked.lock().unwrap().push(summary.clone());
            Ok(self.answer)
        }
    }
}
