use std::io;

use tracing::error;
use tracing_subscriber::EnvFilter;

use insnprobe::config::Config;
use insnprobe::core::{Executor, Explorer};
use insnprobe::error::Result;
use insnprobe::output::analyze_log;

fn run(args: &[String]) -> Result<()> {
    if args.first().map(String::as_str) == Some("analyze") {
        analyze_log(io::stdin().lock(), io::stdout().lock())?;
        return Ok(());
    }
    let config = Config::from_cmdline(&args.join(" "))?;
    let executor = Executor::new()?;
    let mut explorer = Explorer::new(executor, config, io::stdout().lock());
    explorer.run()?;
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    if let Err(e) = run(&args) {
        error!("{}", e);
        std::process::exit(1);
    }
}
