//! Console prompts for the interactive surfaces.
//!
//! Stdin is read on the blocking pool so prompts never stall the runtime.
//! Parsing of what the operator typed is kept in pure functions.

use std::io::{self, Write};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use crate::protocol::download::FileSelector;
use crate::protocol::upload::{UploadDecider, UploadOffer};
use crate::protocol::{parse_selection, APPROVAL_TOKEN};

/// Entry of the client shell menu
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuChoice {
    Download,
    Upload,
    Quit,
}

pub fn parse_menu_choice(input: &str) -> Option<MenuChoice> {
    match input.trim() {
        "1" => Some(MenuChoice::Download),
        "2" => Some(MenuChoice::Upload),
        "q" | "quit" | "exit" => Some(MenuChoice::Quit),
        _ => None,
    }
}

/// What the operator typed at the file selection prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionInput {
    Selected(usize),
    Cancel,
    Invalid,
}

pub fn interpret_selection_input(input: &str, max: usize) -> SelectionInput {
    let input = input.trim();
    if input.eq_ignore_ascii_case("q") {
        return SelectionInput::Cancel;
    }

    match parse_selection(input, max) {
        Some(selection) => SelectionInput::Selected(selection),
        None => SelectionInput::Invalid,
    }
}

/// Read one line from stdin; `None` at end of input
pub async fn read_stdin_line() -> io::Result<Option<String>> {
    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        let read = io::stdin().read_line(&mut line)?;
        if read == 0 {
            Ok(None)
        } else {
            Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
        }
    })
    .await
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
}

/// Print `prompt` without a newline and read the answer
pub async fn prompt_line(prompt: &str) -> io::Result<Option<String>> {
    let mut stdout = io::stdout();
    write!(stdout, "{}", prompt)?;
    stdout.flush()?;
    read_stdin_line().await
}

/// Asks the server operator about every upload.
///
/// Concurrent sessions share stdin, so prompts are answered one at a time.
#[derive(Default)]
pub struct ConsoleApprover {
    lock: Mutex<()>,
}

impl ConsoleApprover {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UploadDecider for ConsoleApprover {
    async fn decide_upload(&self, offer: &UploadOffer) -> bool {
        let _guard = self.lock.lock().await;

        let question = format!(
            "Client wants to upload {} ({}). Accept? (yes/no): ",
            offer.name,
            offer.human_size()
        );

        match prompt_line(&question).await {
            Ok(Some(answer)) => answer.trim() == APPROVAL_TOKEN,
            Ok(None) => {
                warn!("No operator input, declining {}", offer.name);
                false
            }
            Err(e) => {
                warn!("Failed to read approval: {}", e);
                false
            }
        }
    }
}

/// Answers every upload the same way
#[derive(Debug, Clone, Copy)]
pub struct FixedDecision(pub bool);

#[async_trait]
impl UploadDecider for FixedDecision {
    async fn decide_upload(&self, _offer: &UploadOffer) -> bool {
        self.0
    }
}

/// Lets the operator pick a file from a listing
#[derive(Debug, Default)]
pub struct ConsoleSelector;

#[async_trait]
impl FileSelector for ConsoleSelector {
    async fn select(&mut self, names: &[String]) -> Option<usize> {
        if names.is_empty() {
            println!("📁 No files available");
            return None;
        }

        println!("Available files:");
        for (i, name) in names.iter().enumerate() {
            println!("{:>4}: {}", i + 1, name);
        }

        let mut question = "Enter the number of the file to download (q to cancel): ".to_string();
        loop {
            let input = match prompt_line(&question).await {
                Ok(Some(input)) => input,
                Ok(None) => return None,
                Err(e) => {
                    warn!("Failed to read selection: {}", e);
                    return None;
                }
            };

            match interpret_selection_input(&input, names.len()) {
                SelectionInput::Selected(selection) => return Some(selection),
                SelectionInput::Cancel => return None,
                SelectionInput::Invalid => {
                    question = format!(
                        "Invalid selection. Enter a number between 1 and {} (q to cancel): ",
                        names.len()
                    );
                }
            }
        }
    }
}
