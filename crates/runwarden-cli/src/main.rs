use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use colored::Colorize;
use runwarden_core::config::SchedulerKind;
use runwarden_runner::cli::Commands as RunnerCommands;
use std::path::PathBuf;
use which::which;

#[derive(Parser)]
#[command(name = "runwarden")]
#[command(about = "Supervises cluster batch jobs and workflow-engine runs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(long, help = "Print help for all commands recursively")]
    help_all: bool,

    #[arg(short, long, action = clap::ArgAction::Count, global = true, help = "Increase verbosity level")]
    pub verbose: u8,

    #[arg(
        long,
        global = true,
        help = "Path to a config.toml overriding the default location"
    )]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Runner(Box<RunnerCommands>),

    #[command(about = "Generate shell completions")]
    Completions(CompletionsArgs),
}

#[derive(Args)]
struct CompletionsArgs {
    #[arg(long, help = "Shell to generate completions for")]
    shell: Shell,
}

fn print_help_all() {
    let cmd = Cli::command();
    print_command_help(&cmd, 0);
}

fn print_command_help(cmd: &clap::Command, depth: usize) {
    let indent = "  ".repeat(depth);

    if cmd.is_hide_set() {
        return;
    }

    if depth == 0 {
        println!("{}", "=".repeat(60));
        println!("RUNWARDEN - Complete Command Reference");
        println!("{}", "=".repeat(60));
        println!();
    } else {
        println!();
        println!("{}{}", indent, "-".repeat(50 - indent.len()));
        println!("{}Command: {}", indent, cmd.get_name());
        println!("{}{}", indent, "-".repeat(50 - indent.len()));
    }

    let mut help_cmd = cmd.clone();
    for line in help_cmd.render_help().to_string().lines() {
        println!("{}{}", indent, line);
    }

    for subcmd in cmd.get_subcommands() {
        print_command_help(subcmd, depth + 1);
    }
}

fn scheduler_tools(kind: SchedulerKind) -> &'static [&'static str] {
    match kind {
        SchedulerKind::Lsf => &["bsub", "bjobs", "bkill"],
        SchedulerKind::Slurm => &["sbatch", "sacct", "scancel"],
    }
}

/// Warns about scheduler binaries that are neither in `tools_dir` nor on PATH.
fn check_scheduler_tools(command: &RunnerCommands, config_path: Option<&PathBuf>) {
    let flag = match command {
        RunnerCommands::RetryRun(args) => args.scheduler.as_deref(),
        RunnerCommands::CheckAlive(args) => args.scheduler.as_deref(),
        _ => return,
    };
    let Ok(config) = runwarden_runner::load_config(config_path.map(PathBuf::as_path)) else {
        return;
    };
    let kind = match flag {
        Some(name) => match name.parse::<SchedulerKind>() {
            Ok(kind) => kind,
            Err(_) => return,
        },
        None => config.scheduler.kind,
    };

    for tool in scheduler_tools(kind) {
        let in_tools_dir = config
            .scheduler
            .tools_dir
            .as_ref()
            .is_some_and(|dir| dir.join(tool).exists());
        if !in_tools_dir && which(tool).is_err() {
            eprintln!(
                "{}",
                format!(
                    "[WARN] '{}' is not on PATH; {} commands will fail. Set [scheduler] tools_dir in config.toml if it lives elsewhere.",
                    tool, kind
                )
                .yellow()
            );
        }
    }
}

fn main() {
    let cli = Cli::parse();

    if cli.help_all {
        print_help_all();
        return;
    }

    let command = match cli.command {
        Some(cmd) => cmd,
        None => {
            if let Err(e) = Cli::command().print_help() {
                eprintln!("{}", format!("[ERROR] {}", e).red());
                std::process::exit(1);
            }
            return;
        }
    };

    match command {
        Commands::Runner(cmd) => {
            runwarden_runner::init_logging(
                cli.verbose,
                cli.config.as_deref(),
                !cmd.is_machine_facing(),
            );
            check_scheduler_tools(cmd.as_ref(), cli.config.as_ref());

            let runner_cli = runwarden_runner::cli::Cli {
                command: *cmd,
                verbose: cli.verbose,
                config: cli.config,
            };

            if let Err(e) = runwarden_runner::run(runner_cli) {
                eprintln!("{}", format!("[ERROR] {}", e).red());
                std::process::exit(1);
            }
        }
        Commands::Completions(args) => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(args.shell, &mut cmd, name, &mut std::io::stdout());
        }
    }
}
