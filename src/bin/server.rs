//! Branch server binary.
//!
//! Usage: `server <BRANCH_NAME> <CONFIG_FILE>`

use std::path::Path;

use anyhow::Context;
use env_logger::Env;

use teller::config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(Env::default().default_filter_or("info"));

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 3 {
        eprintln!("usage: server <BRANCH_NAME> <CONFIG_FILE>");
        std::process::exit(1);
    }
    let branch_name = &args[1];
    let config_path = Path::new(&args[2]);

    let roster = config::load_roster(config_path)
        .with_context(|| format!("loading roster from {}", config_path.display()))?;
    let local = config::find_branch(&roster, branch_name)?.clone();

    teller::run_branch(local, roster).await?;
    Ok(())
}
