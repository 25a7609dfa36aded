use anyhow::Result;
use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;

use idguide::editing::rank_store::collect_rankings;
use idguide::editing::{format_distance, RankedResult};

/// List the best edited candidates of every pair in an output directory
#[derive(Parser, Debug)]
#[command(name = "rank_report", version, about)]
struct Args {
    /// Output directory of an editing run
    output: PathBuf,

    /// Candidates shown per pair
    #[arg(short, long, default_value_t = 1)]
    top: usize,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,
}

#[derive(serde::Serialize)]
struct PairRanking {
    pair: String,
    candidates: Vec<RankedResult>,
}

fn main() -> Result<()> {
    idguide::logging::init_logger();
    let args = Args::parse();

    if !args.output.is_dir() {
        eprintln!("Error: output directory not found: {}", args.output.display());
        std::process::exit(1);
    }
    info!("Reading rankings from {}", args.output.display());

    let rankings: Vec<PairRanking> = collect_rankings(&args.output)?
        .into_iter()
        .map(|(pair, ranked)| PairRanking { pair, candidates: ranked.into_iter().take(args.top).collect() })
        .collect();
    if rankings.is_empty() {
        warn!("No rank directories below {}", args.output.display());
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&rankings)?);
        return Ok(());
    }

    for ranking in &rankings {
        println!("pair {}:", ranking.pair);
        if ranking.candidates.is_empty() {
            println!("  (no candidates)");
        }
        for candidate in &ranking.candidates {
            println!("  {}  {}", format_distance(candidate.distance), candidate.path.display());
        }
    }
    Ok(())
}
