//! vecfuse CLI
//!
//! Runs capability analysis on an ONNX model and reports the subgraphs the
//! provider would claim together with their vectorization plans.

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process;
use vecfuse::{
    ComputeGraph, CpuFeatures, ExecutionProvider, ProviderConfig, ReducePlan, TargetProfile, TargetSelector,
    SUBGRAPH_PREFIX,
};

/// vecfuse - fused SIMD subgraphs for ONNX execution providers
#[derive(Parser, Debug)]
#[command(name = "vecfuse")]
#[command(version)]
#[command(about = "Inspect how an ONNX model is partitioned and vectorized", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run capability analysis on a model
    ///
    /// 1. Load ONNX → ComputeGraph
    /// 2. Infer and check shapes
    /// 3. Partition eligible nodes into fused subgraphs
    /// 4. Plan vector width and fuse depth for every reduction
    Inspect(InspectArgs),

    /// List target profiles and the one selected for this host
    Targets,
}

#[derive(Parser, Debug)]
struct InspectArgs {
    /// Path to input ONNX model file
    #[arg(short, long)]
    input: PathBuf,

    /// Target profile: stackvm, llvm, avx2, avx512 (default: llvm)
    #[arg(short, long)]
    target: Option<String>,

    /// Path to config file (TOML format)
    ///
    /// If not specified, searches for config in:
    /// 1. ./vecfuse.toml
    /// 2. ./.vecfuse.toml
    /// 3. <user config dir>/vecfuse/provider.toml
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Enable per-node parallel execution in generated code
    #[arg(short, long)]
    parallel: bool,

    /// Accept input/output buffers that are not element-aligned
    #[arg(long = "allow-unaligned")]
    allow_unaligned: bool,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct InspectReport {
    model: String,
    target: vecfuse::TargetDescriptor,
    nodes: usize,
    claimed: usize,
    subgraphs: Vec<SubgraphReport>,
}

#[derive(Serialize)]
struct SubgraphReport {
    name: String,
    nodes: Vec<String>,
    inputs: Vec<String>,
    outputs: Vec<String>,
    reductions: Vec<ReductionReport>,
}

#[derive(Serialize)]
struct ReductionReport {
    node: String,
    #[serde(flatten)]
    plan: ReducePlan,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Inspect(args) => run_inspect(args),
        Commands::Targets => run_targets(),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn run_inspect(args: InspectArgs) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => ProviderConfig::load(path).with_context(|| format!("loading config {}", path.display()))?,
        None => ProviderConfig::find_and_load()?.unwrap_or_default(),
    };
    let options = config.merge_with_cli(
        args.target.clone(),
        args.parallel.then_some(true),
        args.allow_unaligned.then_some(true),
    );

    let graph = ComputeGraph::load(&args.input).with_context(|| format!("loading model {}", args.input.display()))?;
    let mut provider = ExecutionProvider::new(options).context("creating execution provider")?;
    let capability = provider.get_capability(&graph).context("capability analysis")?;

    let subgraphs = capability
        .subgraphs
        .iter()
        .enumerate()
        .map(|(index, descriptor)| {
            let plans = provider.plan_reductions(&graph, descriptor, &capability.shapes);
            let reductions = descriptor
                .nodes()
                .iter()
                .filter_map(|id| {
                    plans.get(id).map(|plan| ReductionReport {
                        node: graph.display_name(*id),
                        plan: plan.clone(),
                    })
                })
                .collect();
            SubgraphReport {
                name: format!("{}_{}", SUBGRAPH_PREFIX, index),
                nodes: descriptor.nodes().iter().map(|&id| graph.display_name(id)).collect(),
                inputs: descriptor.inputs().to_vec(),
                outputs: descriptor.outputs().to_vec(),
                reductions,
            }
        })
        .collect();

    let report = InspectReport {
        model: args.input.display().to_string(),
        target: provider.target().clone(),
        nodes: graph.node_count(),
        claimed: capability.claimed_count(),
        subgraphs,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report, &graph);
    }
    Ok(())
}

fn print_report(report: &InspectReport, graph: &ComputeGraph) {
    println!("Model:     {}", report.model);
    println!("Target:    {}", report.target);
    println!("Claimed:   {}/{} nodes in {} subgraph(s)", report.claimed, report.nodes, report.subgraphs.len());
    println!("{}", graph.statistics());

    for subgraph in &report.subgraphs {
        println!();
        println!("{} ({} nodes)", subgraph.name, subgraph.nodes.len());
        println!("  inputs:  {}", subgraph.inputs.join(", "));
        println!("  outputs: {}", subgraph.outputs.join(", "));
        for r in &subgraph.reductions {
            println!(
                "  {}: axes {:?} width {} (natural {}) fuse_dim {} aligned {}",
                r.node,
                r.plan.axes,
                r.plan.plan.vector_width,
                r.plan.natural_width,
                r.plan.plan.fuse_dim,
                r.plan.plan.last_dim_aligned
            );
        }
    }
}

fn run_targets() -> anyhow::Result<()> {
    let features = CpuFeatures::detect();
    println!("Host features: avx2={} avx512f={}", features.avx2, features.avx512f);
    for profile in [
        TargetProfile::StackVm,
        TargetProfile::Llvm,
        TargetProfile::Avx2,
        TargetProfile::Avx512,
    ] {
        let marker = if profile == TargetProfile::DEFAULT { " (default)" } else { "" };
        println!("  {}{}", profile, marker);
    }
    let selected = TargetSelector::host().select(None)?;
    println!("Auto-selected: {}", selected);
    Ok(())
}
