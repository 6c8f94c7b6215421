use clap::Parser;
use edgeflash_core::cli::Cli;
use edgeflash_core::commands::Session;
use edgeflash_core::config::Config;
use edgeflash_core::errors::exit_code_for;
use edgeflash_core::logging;
use edgeflash_core::selector::TerminalPrompter;
use edgeflash_hal::LinuxHal;

fn run(cli: &Cli) -> anyhow::Result<i32> {
    let cfg = Config::load(cli.config.as_deref())?;
    let hal = LinuxHal::new();
    let mut prompter = TerminalPrompter;
    Ok(Session::new(&hal, &cfg, cli.dry_run).dispatch(&cli.command, &mut prompter))
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    log::debug!("{:?}", cli.command);

    let code = match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            log::error!("{e:#}");
            eprintln!("Error: {e:#}");
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}
