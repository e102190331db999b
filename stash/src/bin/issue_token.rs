use clap::Parser;
use std::time::Duration;

use stash::auth::TokenKeys;
use stash::storage::PrincipalId;

/// Mint a principal token for calling the links API.
#[derive(Parser, Debug)]
#[command(name = "issue_token")]
struct Args {
    /// Owner id placed in the token subject
    owner: i64,

    /// Token lifetime in hours
    #[arg(long, default_value_t = 24)]
    hours: u64,

    /// Env var holding the signing secret
    #[arg(long, default_value = "STASH_JWT_SECRET")]
    secret_env: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    dotenv::dotenv().ok();

    let keys = TokenKeys::from_env(&args.secret_env);
    let token = keys.issue(PrincipalId(args.owner), Duration::from_secs(args.hours * 3600))?;

    println!("{}", token);
    Ok(())
}
