//! Operator confirmation with a deadline.

use crate::evict::Consent;
use std::io::{BufRead, IsTerminal, Write};
use std::sync::mpsc;
use std::time::Duration;
use tracing::warn;

/// Default time the operator has to answer.
pub const DEFAULT_CONSENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Asks on stderr, reads one line from stdin. No answer in time means no.
#[derive(Debug, Clone, Copy)]
pub struct TimedPrompt {
    timeout: Duration,
}

impl Default for TimedPrompt {
    fn default() -> Self {
        Self::new(DEFAULT_CONSENT_TIMEOUT)
    }
}

impl TimedPrompt {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Consent for TimedPrompt {
    fn confirm(&self, question: &str) -> bool {
        if !std::io::stdin().is_terminal() {
            warn!("stdin is not a terminal; treating confirmation as refused (use --yes)");
            return false;
        }

        eprint!("{} [y/N] (no answer in {}s = no): ", question, self.timeout.as_secs());
        let _ = std::io::stderr().flush();

        let (tx, rx) = mpsc::channel();
        // The reader thread is left blocked on stdin if the deadline passes.
        std::thread::spawn(move || {
            let mut line = String::new();
            let _ = std::io::stdin().lock().read_line(&mut line);
            let _ = tx.send(line);
        });

        answer_within(&rx, self.timeout)
    }
}

/// Wait up to `timeout` for one answer line. Silence or a closed reader is a no.
fn answer_within(answers: &mpsc::Receiver<String>, timeout: Duration) -> bool {
    match answers.recv_timeout(timeout) {
        Ok(answer) => is_yes(&answer),
        Err(mpsc::RecvTimeoutError::Timeout) => {
            eprintln!();
            warn!(timeout_secs = timeout.as_secs(), "Confirmation timed out");
            false
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => false,
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
