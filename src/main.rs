mod cli;

use clap::Parser;
use cli::Cli;
use courier::bridge::BridgeError;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli::execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            let code = e
                .downcast_ref::<BridgeError>()
                .map_or(1, BridgeError::exit_code);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}
