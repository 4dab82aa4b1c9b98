//! ChIP-seq HMM CLI
//!
//! Command-line interface for fitting the ZINM-HMM and calling enriched
//! regions from binned count profiles.

use std::fs::File;

use anyhow::Result;
use chip_hmm::{
    calls::{call_regions, most_enriched_state, state_profiles, write_regions},
    data::{read_counts_path, write_results, CountMatrix},
    models::{fit_zinb, EmissionModel, FitConfig, FitResult, HmmParams, ZinmHmm},
};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chip_hmm")]
#[command(about = "ZINM-HMM segmentation of multi-track ChIP-seq count profiles")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit the HMM and decode the profile
    Fit {
        /// Input TSV (block label + count tracks, NA for missing)
        #[arg(short, long)]
        input: String,

        /// Number of hidden states
        #[arg(short = 'n', long, default_value = "2")]
        states: usize,

        /// Maximum Baum-Welch iterations
        #[arg(long, default_value = "500")]
        max_iter: usize,

        /// Output TSV for per-bin states and posteriors
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Fit the HMM and call enriched regions
    Peaks {
        /// Input TSV (block label + count tracks, NA for missing)
        #[arg(short, long)]
        input: String,

        /// Number of hidden states
        #[arg(short = 'n', long, default_value = "2")]
        states: usize,

        /// Output TSV for the called regions
        #[arg(short, long)]
        output: Option<String>,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("chip_hmm=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Fit {
            input,
            states,
            max_iter,
            output,
        } => {
            run_fit(&input, states, max_iter, output.as_deref())?;
        }
        Commands::Peaks {
            input,
            states,
            output,
        } => {
            run_peaks(&input, states, output.as_deref())?;
        }
    }

    Ok(())
}

fn train(input: &str, states: usize, max_iter: usize) -> Result<(CountMatrix, ZinmHmm, FitResult)> {
    println!("{}", "Loading profile...".cyan());
    let counts = read_counts_path(input)?;
    println!(
        "Loaded {} bins, {} tracks, {} blocks",
        counts.n_rows(),
        counts.n_tracks(),
        counts.n_blocks()
    );

    println!("{}", "Fitting control-track ZINB...".cyan());
    let zinb = fit_zinb(&counts.control())?;
    println!(
        "  a = {:.4}, pi = {:.4}, p = {:.4}",
        zinb.a, zinb.pi, zinb.p
    );

    println!(
        "{}",
        format!("Training {}-state HMM (max {} iterations)...", states, max_iter).cyan()
    );
    let mut hmm = ZinmHmm::new(HmmParams::seeded(states, &counts, &zinb))?.with_config(FitConfig {
        max_iter,
        ..Default::default()
    });
    let fit = hmm.fit(&counts)?;

    println!(
        "{}",
        format!(
            "Training complete! Log-likelihood: {:.4} ({} iterations{})",
            fit.log_likelihood,
            fit.iterations,
            if fit.converged { ", converged" } else { "" }
        )
        .green()
    );

    // Show transition matrix
    println!("\nTransition Matrix:");
    let trans = hmm.transition_matrix();
    for i in 0..states {
        print!("  State {}: ", i);
        for j in 0..states {
            print!("{:.3}  ", trans[[i, j]]);
        }
        println!();
    }

    Ok((counts, hmm, fit))
}

fn run_fit(input: &str, states: usize, max_iter: usize, output: Option<&str>) -> Result<()> {
    let (counts, hmm, fit) = train(input, states, max_iter)?;

    println!("{}", "Decoding Viterbi path...".cyan());
    let path = hmm.predict(&counts)?;

    // Show per-state occupancy
    println!("\nState occupancy:");
    for i in 0..states {
        let bins = path.iter().filter(|&&s| s == i).count();
        println!(
            "  State {}: {} bins ({:.1}%)",
            i,
            bins,
            100.0 * bins as f64 / path.len() as f64
        );
    }

    if let Some(out_path) = output {
        write_results(File::create(out_path)?, &counts, &path, &fit.posteriors)?;
        println!("{}", format!("Saved results to {}", out_path).green());
    }

    Ok(())
}

fn run_peaks(input: &str, states: usize, output: Option<&str>) -> Result<()> {
    let (counts, hmm, fit) = train(input, states, 500)?;

    let emission = match &hmm.params.emission {
        EmissionModel::ZeroInflated(z) => z,
        EmissionModel::Mixture(_) => unreachable!("the trainer only fits the ZINM family"),
    };

    println!("\nState profiles:");
    for profile in state_profiles(emission) {
        println!(
            "  State {}: control {:.2}, signal {:.2} ({:.2}x)",
            profile.state,
            profile.expected_control,
            profile.expected_signal,
            profile.enrichment()
        );
    }

    let target = most_enriched_state(emission);
    println!("\nCalling regions for state {}...", target);

    let path = hmm.predict(&counts)?;
    let regions = call_regions(&counts, &path, &fit.posteriors, target)?;

    println!(
        "{}",
        format!("Called {} enriched regions", regions.len()).green()
    );
    for region in regions.iter().take(10) {
        println!(
            "  {}:{}-{} (posterior {:.3})",
            region.block, region.start, region.end, region.mean_posterior
        );
    }
    if regions.len() > 10 {
        println!("  ...");
    }

    if let Some(out_path) = output {
        write_regions(File::create(out_path)?, &regions)?;
        println!("{}", format!("Saved regions to {}", out_path).green());
    }

    Ok(())
}
