use clap::{CommandFactory, Parser};
use clap_complete::aot::generate;
use kioskboot::cli::{Cli, Commands};
use kioskboot::{commands, logging};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    let config_file = cli.global.config_file.as_deref();

    // `start` sets up its own logging once it knows where the logs dir is.
    let _log_guard = match cli.command {
        Commands::Start { .. } => None,
        _ => logging::init(None),
    };

    let result = match cli.command {
        Commands::Start { follow } => commands::start::run(config_file, follow).await,
        Commands::Stop => commands::stop::run(config_file).await.map(|_| 0),
        Commands::Ps { json } => commands::ps::run(config_file, json).map(|_| 0),
        Commands::Plan { json } => commands::plan::run(config_file, json).await.map(|_| 0),
        Commands::Doctor => commands::doctor::run(config_file).await.map(|_| 0),
        Commands::Validate => commands::validate::run(config_file).map(|_| 0),
        Commands::Completions { shell } => {
            generate(shell, &mut Cli::command(), "kioskboot", &mut std::io::stdout());
            Ok(0)
        }
    };

    match result {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}
