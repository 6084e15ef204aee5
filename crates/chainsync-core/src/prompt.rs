//! Interactive yes/no confirmation on the console.
//!
//! [`ConsolePrompt`] is the interactive [`ConfirmPrompt`]: pass it in
//! [`EngineParts`](crate::engine::EngineParts) to let an operator decide a
//! startup conflict. Unattended runs use [`FixedPrompt`](crate::source::FixedPrompt).

use std::io::{self, BufRead, Write};

use crate::source::ConfirmPrompt;

/// Asks on stderr and reads the answer from stdin.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsolePrompt;

impl ConsolePrompt {
    /// Repeat `question` until the reader answers yes or no. EOF counts as no.
    pub fn ask<R: BufRead, W: Write>(question: &str, mut input: R, mut output: W) -> io::Result<bool> {
        let mut line = String::new();
        loop {
            write!(output, "{question} [y/n] ")?;
            output.flush()?;
            line.clear();
            if input.read_line(&mut line)? == 0 {
                writeln!(output)?;
                return Ok(false);
            }
            match line.trim().to_ascii_lowercase().as_str() {
                "y" | "yes" => return Ok(true),
                "n" | "no" => return Ok(false),
                _ => writeln!(output, "Please answer 'y' or 'n'.")?,
            }
        }
    }

    pub fn ask_console(question: &str) -> bool {
        let stdin = io::stdin();
        match Self::ask(question, stdin.lock(), io::stderr()) {
            Ok(answer) => answer,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read confirmation");
                false
            }
        }
    }
}

fn reset_question(configured: u64, persisted: u64) -> String {
    format!(
        "Start block {configured} is past the stored data (last block {persisted}). \
         Delete all data and start from block {configured}?"
    )
}

impl ConfirmPrompt for ConsolePrompt {
    fn confirm_reset(&self, configured: u64, persisted: u64) -> bool {
        Self::ask_console(&reset_question(configured, persisted))
    }
}
