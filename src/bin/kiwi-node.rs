#![forbid(unsafe_code)]
//! Runs a local KiwiChain ledger with competing demo producers.

use clap::Parser;
use colored::*;
use kiwichain::blockchain::Block;
use kiwichain::config::load_config;
use kiwichain::consensus::ConsensusMode;
use kiwichain::contract::NoContractRuntime;
use kiwichain::node::Node;
use kiwichain::wallet::{EmbeddedKeyDirectory, Wallet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEMO_BALANCE: u64 = 1_000;

/// KiwiChain node
///
/// Loads the configuration, funds a set of demo wallets at genesis, queues a
/// few transfers between them and lets the producers compete for blocks.
#[derive(Parser, Debug)]
#[command(name = "kiwi-node")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short = 'c', long, default_value = "kiwi.toml")]
    config: PathBuf,

    /// Consensus mode: work or stake
    #[arg(short = 'm', long)]
    mode: Option<ConsensusMode>,

    /// Chain height to produce up to
    #[arg(short = 'r', long)]
    rounds: Option<u64>,

    /// Number of competing producers
    #[arg(short = 'p', long)]
    producers: Option<usize>,

    /// Proof-of-work difficulty in leading zero bits
    #[arg(short = 'd', long)]
    difficulty: Option<u32>,

    /// Seed for the proof-of-stake lottery
    #[arg(long)]
    seed: Option<u64>,

    /// Number of demo wallets funded at genesis
    #[arg(short = 'w', long, default_value = "3")]
    wallets: usize,

    /// Print the final chain as JSON
    #[arg(long)]
    json: bool,
}

fn short(hash: &str) -> String {
    if hash.len() > 16 {
        format!("{}...", &hash[..16])
    } else {
        hash.to_string()
    }
}

fn print_chain(chain: &[Block], node: &Node, wallets: &[Wallet]) {
    println!("{}", "KiwiChain".bright_green().bold());
    println!("{}", "---------".bright_green());
    for block in chain {
        println!(
            "{} {}  prev {}  proposer {}  txs {}  reward {}",
            format!("#{:<4}", block.index).bright_cyan().bold(),
            short(&block.hash_str()).bright_white(),
            short(&hex::encode(block.prev_hash)).dimmed(),
            short(&block.proposer).yellow(),
            block.transactions.len(),
            block.reward
        );
        for tx in &block.transactions {
            println!(
                "       {} -> {}  {} (fee {})",
                short(&tx.sender).red(),
                short(&tx.receiver).green(),
                tx.amount,
                tx.fee
            );
        }
    }

    println!();
    println!("{}", "Balances".bright_green().underline());
    for wallet in wallets {
        let identity = wallet.identity();
        println!(
            "  {}  {}",
            short(&identity).bright_white(),
            node.ledger().balance_of(&identity).to_string().bright_yellow()
        );
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = load_config(&args.config)?;
    if let Some(mode) = args.mode {
        config.consensus.mode = mode;
    }
    if let Some(rounds) = args.rounds {
        config.node.rounds = rounds;
    }
    if let Some(producers) = args.producers {
        config.node.producers = producers;
    }
    if let Some(difficulty) = args.difficulty {
        config.consensus.difficulty = difficulty;
    }
    if args.seed.is_some() {
        config.consensus.seed = args.seed;
    }

    let wallets: Vec<Wallet> = (0..args.wallets.max(1)).map(|_| Wallet::generate()).collect();
    let stake_demo = config.consensus.mode == ConsensusMode::Stake && config.genesis.stakes.is_empty();
    for (i, wallet) in wallets.iter().enumerate() {
        config.genesis.balances.entry(wallet.identity()).or_insert(DEMO_BALANCE);
        if stake_demo {
            config.genesis.stakes.insert(wallet.identity(), 10 * (i as u64 + 1));
        }
    }

    let rounds = config.node.rounds;
    let producer_count = config.node.producers.max(1);
    let mut node = Node::init(config, Arc::new(EmbeddedKeyDirectory), Arc::new(NoContractRuntime))?;
    let arbiter = node.spawn_arbiter()?;

    for (i, wallet) in wallets.iter().enumerate() {
        let to = &wallets[(i + 1) % wallets.len()];
        let tx = wallet.create_transaction(&to.identity(), 10 * (i as u64 + 1), i as u64 + 1)?;
        match node.submit_transaction(tx) {
            Ok(hash) => info!(tx = %hex::encode(hash), "Queued demo transfer"),
            Err(e) => warn!(error = %e, "Demo transfer refused"),
        }
    }

    let mut tasks = Vec::with_capacity(producer_count);
    for i in 0..producer_count {
        let producer = node.producer(wallets[i % wallets.len()].identity());
        tasks.push(tokio::spawn(async move { producer.run(rounds).await }));
    }
    for task in tasks {
        match task.await? {
            Ok(committed) => info!(committed, "Producer finished"),
            Err(e) => warn!(error = %e, "Producer stopped"),
        }
    }

    node.shutdown();
    node.ledger().verify_chain()?;
    let chain = node.handle().get_chain_snapshot();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&chain)?);
    } else {
        print_chain(&chain, &node, &wallets);
    }

    drop(node);
    arbiter.await??;
    Ok(())
}
