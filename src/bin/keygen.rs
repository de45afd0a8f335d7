// Key generation CLI for Lucid validators

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lucid_chain::crypto::keys::{generate_seed, public_from_seed};
use std::fs;
use std::io::Write;

#[derive(Parser)]
#[command(name = "lucid-keygen")]
#[command(about = "Generate validator keys for a Lucid node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a validator seed and print its public key
    Validator {
        /// Node id written next to the seed
        #[arg(long)]
        node_id: String,
        /// Append LUCID_NODE_ID and LUCID_VALIDATOR_SEED to this .env file
        #[arg(short, long)]
        env_file: Option<String>,
        /// Print only the seed hex
        #[arg(short, long)]
        stdout: bool,
    },
    /// Print the public key for an existing seed
    Pubkey {
        /// 32-byte seed, hex
        seed: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validator {
            node_id,
            env_file,
            stdout,
        } => generate_validator_key(&node_id, env_file.as_deref(), stdout)?,
        Commands::Pubkey { seed } => {
            let bytes = hex::decode(seed.trim()).context("seed must be hex")?;
            let public = public_from_seed(&bytes).context("seed must be 32 bytes")?;
            println!("{}", hex::encode(public));
        }
    }

    Ok(())
}

fn generate_validator_key(node_id: &str, env_file: Option<&str>, stdout: bool) -> Result<()> {
    let seed = generate_seed();
    let public = public_from_seed(&seed).context("derive public key")?;
    let seed_hex = hex::encode(seed);
    let public_hex = hex::encode(public);

    if stdout {
        println!("{}", seed_hex);
        return Ok(());
    }

    match env_file {
        Some(path) => {
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .context("Failed to open .env file")?;
            writeln!(file, "\n# Validator key ({})", chrono::Utc::now())?;
            writeln!(file, "LUCID_NODE_ID={}", node_id)?;
            writeln!(file, "LUCID_VALIDATOR_SEED={}", seed_hex)?;
            println!("Seed for {} saved to {}", node_id, path);
            println!("  - Never commit {} to version control", path);
        }
        None => {
            println!("LUCID_NODE_ID={}", node_id);
            println!("LUCID_VALIDATOR_SEED={}", seed_hex);
            println!("\nAdd these to your .env file");
        }
    }
    println!("\nPublic key (share with other validators):");
    println!("  lucid-node register-validator --node-id {} --public-key {}", node_id, public_hex);

    Ok(())
}
