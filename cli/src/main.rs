use std::io::IsTerminal;

use babbla::{execute, Cli, Stdin};
use clap::Parser;
use tts_core::CancellationToken;

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();
    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    babbla::app::cancel_on_ctrl_c(cancel.clone());

    let stdin = std::io::stdin();
    let input = Stdin {
        is_terminal: stdin.is_terminal(),
        reader: stdin.lock(),
    };
    let mut stdout = std::io::stdout().lock();

    let code = match execute(cli, |key| std::env::var(key).ok(), input, &mut stdout, cancel).await {
        Ok(()) => 0,
        Err(err) => {
            tracing::error!(error = %err, "babbla failed");
            eprintln!("babbla: {err}");
            err.exit_code()
        }
    };
    std::process::exit(code);
}
