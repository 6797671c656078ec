use clap::Parser;
use colored::Colorize;
use runwarden_runner::cli::Cli;

fn main() {
    let cli = Cli::parse();
    runwarden_runner::init_logging(
        cli.verbose,
        cli.config.as_deref(),
        !cli.command.is_machine_facing(),
    );

    if let Err(e) = runwarden_runner::run(cli) {
        eprintln!("{}", format!("[ERROR] {}", e).red());
        std::process::exit(1);
    }
}
