use argspec2tosca::cli;
use colored::Colorize;

fn main() {
    let command_line_interface = cli::CommandLineInterface::load();

    let mut logger = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"));
    if let Some(level) = command_line_interface.log_level() {
        logger.filter_level(level);
    }
    logger.init();

    if let Err(error) = command_line_interface.run() {
        eprintln!("{} {error:#}", "error:".red().bold());
        std::process::exit(1);
    }
}
