use std::io::{self, BufRead, Write};

use fleet_infra::Result;
use fleet_infra::deployer::Confirm;

/// Asks on stdout and reads the answer from stdin. Anything but `y`/`yes`,
/// including a read failure, is no.
pub struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&self, prompt: &str) -> Result<bool> {
        print!("{prompt} [y/N] ");
        if io::stdout().flush().is_err() {
            return Ok(false);
        }

        let mut answer = String::new();
        match io::stdin().lock().read_line(&mut answer) {
            Ok(_) => Ok(is_yes(&answer)),
            Err(e) => {
                tracing::warn!(error = %e, "could not read confirmation, assuming no");
                Ok(false)
            }
        }
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
