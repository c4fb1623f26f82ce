use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use chrono::Duration;
use clap::Parser;

use blobd::auth::{sign_token, DEFAULT_TOKEN_TTL_HOURS};

/// Issues a signed bearer token for the blobs API.
#[derive(Debug, Parser)]
#[command(name = "blob-token", version)]
struct Args {
    /// Subject recorded as created_by / updated_by on blobs.
    #[arg(long)]
    user_id: String,

    /// Human-readable name embedded in the token claims.
    #[arg(long, default_value = "")]
    user_name: String,

    /// Path to the RSA private key PEM used for signing.
    #[arg(long)]
    key: PathBuf,

    /// Mark the token as an admin token.
    #[arg(long)]
    admin: bool,

    /// Token lifetime in hours.
    #[arg(long, default_value_t = DEFAULT_TOKEN_TTL_HOURS)]
    ttl_hours: i64,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let pem = fs::read(&args.key)
        .with_context(|| format!("reading private key {}", args.key.display()))?;
    let token = sign_token(
        &pem,
        &args.user_id,
        &args.user_name,
        args.admin,
        Duration::hours(args.ttl_hours),
    )
    .context("signing token")?;

    println!("export BLOBS_TOKEN={token}");
    Ok(())
}
