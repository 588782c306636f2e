use butterfly_access::cli::Cli;
use clap::Parser;
use log::error;

fn main() {
    let cli = Cli::parse();

    // Logging goes to stderr; progress lines stay on stdout
    let default_level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .target(env_logger::Target::Stderr)
        .init();

    if let Err(e) = cli.run() {
        error!("❌ Error: {e:#}");
        std::process::exit(1);
    }
}
