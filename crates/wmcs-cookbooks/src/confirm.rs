use std::io::{BufRead, Write};

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfirmError {
    #[error("Aborted by the operator: {0}")]
    Aborted(String),
    #[error("Unable to read confirmation: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Confirmer: Send + Sync {
    /// Asks the operator to approve `message`; an error aborts the operation.
    async fn confirm(&self, message: &str) -> Result<(), ConfirmError>;
}

/// Approves everything. Used with `--yes`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoConfirm;

#[async_trait]
impl Confirmer for AutoConfirm {
    async fn confirm(&self, message: &str) -> Result<(), ConfirmError> {
        info!("auto-confirmed: {}", message);
        Ok(())
    }
}

const CONFIRM_WORD: &str = "go";
const MAX_ATTEMPTS: usize = 3;

/// Prompts on the terminal and waits for the operator to type `go`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalConfirmer;

fn ask(message: &str) -> Result<(), ConfirmError> {
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    for _ in 0..MAX_ATTEMPTS {
        write!(stdout, "{}\nType \"{}\" to proceed: ", message, CONFIRM_WORD)?;
        stdout.flush()?;
        let mut answer = String::new();
        if stdin.lock().read_line(&mut answer)? == 0 {
            break;
        }
        if answer.trim() == CONFIRM_WORD {
            return Ok(());
        }
    }
    Err(ConfirmError::Aborted(message.to_string()))
}

#[async_trait]
impl Confirmer for TerminalConfirmer {
    async fn confirm(&self, message: &str) -> Result<(), ConfirmError> {
        let message = message.to_string();
        tokio::task::spawn_blocking(move || ask(&message))
            .await
            .map_err(|e| ConfirmError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }
}
