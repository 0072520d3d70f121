//! Sats-Engine CLI Application
//!
//! Offline tools around the wallet engine: fee estimates, timelock
//! scripts, key utilities and ledger inspection.

use clap::{Parser, Subcommand};
use sats_engine::cli;
use sats_engine::core::FeeRate;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "sats-engine")]
#[command(version = "0.1.0")]
#[command(about = "BSV wallet engine tools", long_about = None)]
struct Cli {
    /// Engine configuration file (JSON)
    #[arg(short, long, default_value = "engine.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Estimate the fee of a P2PKH transaction
    Fee {
        #[arg(short, long, default_value = "1")]
        inputs: usize,

        /// Outputs including change
        #[arg(short, long, default_value = "2")]
        outputs: usize,

        /// Bytes beyond the standard input/output estimate
        #[arg(long, default_value = "0")]
        extra_bytes: u64,

        /// Fee rate in sat/kB (defaults to the configured rate)
        #[arg(short, long)]
        rate: Option<u64>,
    },

    /// Estimate lock and unlock fees
    LockFee {
        #[arg(short, long, default_value = "1")]
        inputs: usize,

        /// Address the lock pays back to
        #[arg(short, long)]
        address: String,

        #[arg(short, long)]
        unlock_block: u32,

        /// Token origin carried in an OP_RETURN output
        #[arg(long)]
        origin: Option<String>,

        #[arg(short, long)]
        rate: Option<u64>,
    },

    /// Build or parse timelock scripts
    LockScript {
        #[command(subcommand)]
        action: LockScriptCommands,
    },

    /// Derive the receiving address for a counterparty invoice
    Derive {
        /// Identity key (WIF)
        #[arg(long)]
        identity_wif: String,

        /// Counterparty public key (hex)
        #[arg(long)]
        sender_pubkey: String,

        #[arg(long)]
        invoice: String,
    },

    /// Show the address of a WIF, or generate a new key
    Address {
        #[arg(short, long)]
        wif: Option<String>,
    },

    /// Print the effective configuration
    Config,

    /// Inspect a JSON ledger file
    Ledger {
        #[arg(short, long, default_value = "ledger.json")]
        file: PathBuf,

        /// Account (defaults to the configured account)
        #[arg(short, long)]
        account: Option<u32>,

        #[command(subcommand)]
        action: LedgerCommands,
    },
}

#[derive(Subcommand)]
enum LockScriptCommands {
    /// Build the locking script for an address and height
    Build {
        #[arg(short, long)]
        address: String,

        #[arg(short, long)]
        unlock_block: u32,
    },

    /// Decode a locking script
    Parse {
        /// Script hex
        #[arg(short, long)]
        script: String,
    },
}

#[derive(Subcommand)]
enum LedgerCommands {
    /// Spendable, locked and pending totals
    Balance,

    /// List UTXOs
    Utxos,

    /// List locks
    Locks,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = sats_engine::EngineConfig::load(&cli.config)?;
    let rate_or_default =
        |rate: Option<u64>| rate.map(FeeRate).unwrap_or_else(|| config.default_fee_rate());

    match cli.command {
        Commands::Fee {
            inputs,
            outputs,
            extra_bytes,
            rate,
        } => {
            cli::cmd_fee(inputs, outputs, extra_bytes, rate_or_default(rate))?;
        }

        Commands::LockFee {
            inputs,
            address,
            unlock_block,
            origin,
            rate,
        } => {
            cli::cmd_lock_fee(
                inputs,
                &address,
                unlock_block,
                origin.as_deref(),
                rate_or_default(rate),
            )?;
        }

        Commands::LockScript { action } => match action {
            LockScriptCommands::Build {
                address,
                unlock_block,
            } => {
                cli::cmd_lock_script_build(&address, unlock_block)?;
            }
            LockScriptCommands::Parse { script } => {
                cli::cmd_lock_script_parse(&script)?;
            }
        },

        Commands::Derive {
            identity_wif,
            sender_pubkey,
            invoice,
        } => {
            cli::cmd_derive(&identity_wif, &sender_pubkey, &invoice)?;
        }

        Commands::Address { wif } => {
            cli::cmd_address(wif.as_deref())?;
        }

        Commands::Config => {
            cli::cmd_config(&cli.config)?;
        }

        Commands::Ledger {
            file,
            account,
            action,
        } => {
            let account = account.unwrap_or(config.account_id);
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(async {
                match action {
                    LedgerCommands::Balance => cli::cmd_ledger_balance(&file, account).await,
                    LedgerCommands::Utxos => cli::cmd_ledger_utxos(&file, account).await,
                    LedgerCommands::Locks => cli::cmd_ledger_locks(&file, account).await,
                }
            })?;
        }
    }

    Ok(())
}
