// Copyright (c) The parasim Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use clap::Parser;
use color_eyre::Result;
use parasim_cli::ParasimApp;

fn main() -> Result<()> {
    color_eyre::install()?;

    let app = ParasimApp::parse();
    match app.exec() {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            error.display_to_stderr();
            std::process::exit(error.process_exit_code())
        }
    }
}
