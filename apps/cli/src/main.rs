mod commands;
mod progress;

use std::path::PathBuf;

use clap::{CommandFactory, Parser};
use comet_fetcher::RepoSpec;
use comet_launcher::HostEnv;

#[derive(Parser, Debug)]
#[command(
    name = "comet",
    version,
    about = "Comet is an application browser and shell. It will run and keep up to date \
             programs from package repositories.\nIf no coordinate is specified, help is shown."
)]
pub struct CometCli {
    /// Coordinates of the package to run, in the form group:name[:version].
    /// You can omit the version number to fetch the latest version.
    pub coordinate: Option<String>,

    /// Arguments to pass to the invoked program.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,

    /// Re-check with the servers to see if a newer version is available. A
    /// new version check occurs every 24 hours by default.
    #[arg(long, short = 'r')]
    pub refresh: bool,

    /// Deletes the contents of the app cache directory before starting.
    #[arg(long)]
    pub clear_cache: bool,

    /// Skip checks against remote repositories for latest versions.
    #[arg(long)]
    pub offline: bool,

    /// Enable logging.
    #[arg(long)]
    pub verbose: bool,

    /// If specified, overrides the default cache directory.
    #[arg(long)]
    pub cache_path: Option<PathBuf>,

    /// A comma separated list of repository aliases or URLs, which will be
    /// resolved in order.
    #[arg(long, default_value_t = RepoSpec::default_spec())]
    pub repositories: String,

    /// Disables the use of encrypted connections.
    #[arg(long)]
    pub disable_ssl: bool,

    // Invoked by the scheduled job we install, so don't show it in the help.
    #[arg(long, hide = true)]
    pub background_update: bool,

    #[arg(long, hide = true, default_value = "https://update.comet.app/")]
    pub update_url: String,
}

impl CometCli {
    pub fn cache_dir(&self) -> PathBuf {
        match &self.cache_path {
            Some(path) => path.clone(),
            None => dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("comet"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let host_env = HostEnv::from_env();

    // Re-exec'd by restart-and-run: the module list is already resolved and
    // waiting in the environment, boot straight into it. The command line
    // belongs entirely to the app in this mode, so it never goes through
    // our own flag parser.
    if host_env.is_direct_run() {
        setup_logging(false);
        let args: Vec<String> = std::env::args().skip(1).collect();
        if let Err(e) = comet_launcher::run_from_env(&host_env, &args).await {
            commands::render_error(&e.to_string());
            std::process::exit(1);
        }
        return Ok(());
    }

    let cli = CometCli::parse();
    setup_logging(cli.verbose);

    if cli.background_update {
        commands::background::execute(&cli, &host_env).await;
        return Ok(());
    }

    match cli.coordinate.clone() {
        Some(coordinate) => commands::run::execute(&cli, &host_env, &coordinate).await,
        None => {
            // The graphical shell lives elsewhere; with no coordinate the
            // CLI has nothing to do but explain itself.
            CometCli::command().print_help()?;
            Ok(())
        }
    }
}

fn setup_logging(verbose: bool) {
    let default = if verbose { "comet=debug,info" } else { "warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_coordinate_and_passes_the_rest_to_the_app() {
        let cli = CometCli::parse_from(["comet", "org.example:app", "--some-app-flag", "value"]);
        assert_eq!(cli.coordinate.as_deref(), Some("org.example:app"));
        assert_eq!(cli.args, vec!["--some-app-flag", "value"]);
        assert!(!cli.refresh);
    }

    #[test]
    fn own_flags_before_the_coordinate_are_ours() {
        let cli = CometCli::parse_from(["comet", "--refresh", "acme.tool"]);
        assert!(cli.refresh);
        assert_eq!(cli.coordinate.as_deref(), Some("acme.tool"));
        assert!(cli.args.is_empty());
    }
}
