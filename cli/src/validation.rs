use std::io::Read;
use std::path::Path;

use crate::error::CliError;

/// Input longer than this is almost certainly a mistake (a binary file, a log).
const MAX_TEXT_LENGTH: usize = 100_000;

/// Pick the text to speak: the positional argument, else `--file`, else stdin
/// when it is not a terminal.
pub fn resolve_input_text(
    text: Option<&str>,
    file: Option<&Path>,
    stdin: impl Read,
    stdin_is_terminal: bool,
) -> Result<String, CliError> {
    let raw = if let Some(text) = text {
        text.to_string()
    } else if let Some(path) = file {
        std::fs::read_to_string(path).map_err(|e| {
            CliError::InvalidInput(format!("cannot read {}: {e}", path.display()))
        })?
    } else if !stdin_is_terminal {
        let mut buf = String::new();
        let mut stdin = stdin;
        stdin
            .read_to_string(&mut buf)
            .map_err(|e| CliError::InvalidInput(format!("cannot read stdin: {e}")))?;
        buf
    } else {
        return Err(CliError::InvalidInput(
            "no text given (pass TEXT, --file PATH, or pipe via stdin)".to_string(),
        ));
    };
    validate_text(&raw)?;
    Ok(raw)
}

pub fn validate_text(text: &str) -> Result<(), CliError> {
    if text.trim().is_empty() {
        return Err(CliError::InvalidInput("Text cannot be empty".to_string()));
    }
    let len = text.chars().count();
    if len > MAX_TEXT_LENGTH {
        return Err(CliError::InvalidInput(format!(
            "Text too long ({len} characters, max {MAX_TEXT_LENGTH})"
        )));
    }
    Ok(())
}
