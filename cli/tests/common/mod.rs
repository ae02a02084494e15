//! Drive the binary's entry point in-process with a fake environment.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;

use babbla::{execute, Cli, CliError, Stdin};
use clap::Parser;
use tts_core::CancellationToken;

pub struct CliRun {
    pub result: Result<(), CliError>,
    pub stdout: String,
}

impl CliRun {
    pub fn exit_code(&self) -> i32 {
        self.result.as_ref().map_or_else(CliError::exit_code, |_| 0)
    }
}

pub async fn run_cli(args: &[&str], env: &[(&str, &str)], stdin: Option<&str>) -> CliRun {
    let cli = Cli::try_parse_from(std::iter::once("babbla").chain(args.iter().copied()))
        .expect("arguments should parse");
    let env: HashMap<String, String> = env
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let input = Stdin {
        reader: Cursor::new(stdin.unwrap_or_default().to_string()),
        is_terminal: stdin.is_none(),
    };

    let mut out = Vec::new();
    let result = execute(cli, |key| env.get(key).cloned(), input, &mut out, CancellationToken::new()).await;
    CliRun {
        result,
        stdout: String::from_utf8_lossy(&out).into_owned(),
    }
}

pub fn read_json(path: &std::path::Path) -> serde_json::Value {
    serde_json::from_slice(&std::fs::read(path).expect("report should exist")).expect("report should be JSON")
}
