use std::{sync::mpsc, thread};

use abyss::{
    config::{OptimizationParams, SolverSettings},
    error::{AbyssError, AbyssResult},
    extract_surface, optimize, prepare,
    progress::{ProgressEvent, RunStatus},
    stl::read_stl_file,
    LinearSolverKind,
};
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SolverChoice {
    Cholesky,
    Cg,
}

impl From<SolverChoice> for LinearSolverKind {
    fn from(choice: SolverChoice) -> Self {
        match choice {
            SolverChoice::Cholesky => LinearSolverKind::Cholesky,
            SolverChoice::Cg => LinearSolverKind::ConjugateGradient,
        }
    }
}

/// Topology-optimize a solid under point supports and loads
#[derive(Debug, Parser)]
#[command(name = "abyss", version)]
struct Cli {
    /// Optimization request (JSON)
    params: String,
    /// Solid to optimize (STL, binary or ASCII)
    geometry: String,
    /// Where to write the optimized surface
    #[arg(short, long, default_value = "optimized.stl")]
    output: String,
    /// Linear solver backend
    #[arg(long, value_enum, default_value_t = SolverChoice::Cholesky)]
    solver: SolverChoice,
}

fn run(cli: Cli) -> AbyssResult<()> {
    let params = OptimizationParams::from_file(&cli.params)?;
    let mesh = read_stl_file(&cli.geometry)?;
    let settings = SolverSettings {
        linear_solver: cli.solver.into(),
        ..SolverSettings::default()
    };

    info!(
        vertices = mesh.vertices.len(),
        faces = mesh.faces.len(),
        supports = params.fixed_supports.len(),
        loads = params.load_vectors.len(),
        "request loaded"
    );

    let problem = prepare(
        &mesh,
        &params.fixed_supports,
        &params.load_vectors,
        &params.resolution(),
        &settings,
    )?;

    let (tx, rx) = mpsc::channel::<ProgressEvent>();
    let simp = params.simp();
    let worker = {
        let settings = settings.clone();
        thread::spawn(move || {
            let outcome = optimize(&problem, &simp, &settings, &tx);
            (problem, outcome)
        })
    };

    let bar = ProgressBar::new(simp.max_iterations as u64);
    if let Ok(style) =
        ProgressStyle::with_template("{bar:40} {pos}/{len} [{elapsed_precise}] {msg}")
    {
        bar.set_style(style);
    }
    for event in rx {
        match event {
            ProgressEvent::Update(update) => {
                bar.set_position(update.iteration as u64);
                bar.set_message(format!(
                    "c={:.4} vol={:.3} ch={:.4}",
                    update.objective, update.volume_fraction, update.change
                ));
            }
            ProgressEvent::Finished(status) => {
                let message = match &status {
                    RunStatus::Converged => "converged".to_owned(),
                    RunStatus::MaxIterationsReached => "iteration cap reached".to_owned(),
                    RunStatus::Failed(cause) => format!("failed: {cause}"),
                    other => format!("{other:?}"),
                };
                bar.finish_with_message(message);
            }
        }
    }

    let (problem, outcome) = match worker.join() {
        Ok(result) => result,
        Err(_) => {
            return Err(AbyssError::Solver(
                "Optimizer thread panicked".to_owned(),
            ))
        }
    };
    let outcome = outcome?;

    let bytes = extract_surface(
        &outcome.x_phys,
        &problem.grid.resolution,
        problem.grid_bounds(),
        &settings,
    )?;
    std::fs::write(&cli.output, &bytes)?;

    info!(
        output = cli.output.as_str(),
        bytes = bytes.len(),
        iterations = outcome.history.len(),
        "optimized surface written"
    );
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        error!("{err}");
        std::process::exit(1)
    }
}
