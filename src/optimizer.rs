//! SIMP compliance minimization with an Optimality Criteria update.

use std::time::Instant;

use nalgebra::DVector;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::{
    config::SolverSettings,
    datatypes::PreparedProblem,
    element::{element_stiffness_template, ElementMatrix, ElementVector},
    error::{AbyssError, AbyssResult},
    filter::FilterMatrix,
    progress::{ProgressSink, ProgressUpdate, RunStatus},
    solver::{build_linear_solver, build_total_stiffness_matrix, restrict_to_free, LinearSolver},
};

/// Per-run optimization parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimpParameters {
    /// Target mean density over the design domain
    pub volfrac: f64,
    /// Penalization exponent of the material law
    pub penal: f64,
    /// Filter radius in element pitches
    pub rmin: f64,
    /// Convergence threshold on the largest design change
    pub tolx: f64,
    pub max_iterations: usize,
}

impl SimpParameters {
    pub fn validate(&self) -> AbyssResult<()> {
        if !(self.volfrac > 0.0 && self.volfrac < 1.0) {
            return Err(AbyssError::Input(format!(
                "Volume fraction must be within (0, 1), got {}",
                self.volfrac
            )));
        }
        if !(self.penal >= 1.0) || !self.penal.is_finite() {
            return Err(AbyssError::Input(format!(
                "Penalization must be at least 1, got {}",
                self.penal
            )));
        }
        if !(self.rmin > 0.0) || !self.rmin.is_finite() {
            return Err(AbyssError::Input(format!(
                "Filter radius must be positive, got {}",
                self.rmin
            )));
        }
        if !(self.tolx >= 0.0) {
            return Err(AbyssError::Input(format!(
                "Convergence tolerance must be non-negative, got {}",
                self.tolx
            )));
        }
        if self.max_iterations == 0 {
            return Err(AbyssError::Input(
                "At least one iteration is required".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Result of a completed run
#[derive(Debug, Clone)]
pub struct OptimizationOutcome {
    /// Final physical densities in element order; obstacles are exactly 0
    pub x_phys: Vec<f64>,
    /// `Converged` or `MaxIterationsReached`
    pub status: RunStatus,
    pub history: Vec<ProgressUpdate>,
}

/// Runs the optimization to a terminal status
///
/// # Arguments
/// * `problem` - Grid, force vector and DOF partition from `prepare`
/// * `params` - Volume target, penalization, filter radius and stopping rules
/// * `settings` - Material constants, OC numerics and linear solver choice
/// * `sink` - Receives one update per completed iteration, then the
///   terminal status exactly once, also on failure
pub fn optimize(
    problem: &PreparedProblem,
    params: &SimpParameters,
    settings: &SolverSettings,
    sink: &dyn ProgressSink,
) -> AbyssResult<OptimizationOutcome> {
    let result = run(problem, params, settings, sink);
    match &result {
        Ok(outcome) => sink.finish(&outcome.status),
        Err(err) => sink.finish(&RunStatus::Failed(err.to_string())),
    }
    result
}

fn run(
    problem: &PreparedProblem,
    params: &SimpParameters,
    settings: &SolverSettings,
    sink: &dyn ProgressSink,
) -> AbyssResult<OptimizationOutcome> {
    let mut optimizer = SimpOptimizer::new(problem, params, settings)?;
    let mut history = Vec::new();

    while !optimizer.status().is_terminal() {
        let update = optimizer.step()?;
        sink.report(&update);
        history.push(update);
    }

    let status = optimizer.status().clone();
    info!(
        iterations = history.len(),
        status = ?status,
        "optimization finished"
    );

    Ok(OptimizationOutcome {
        x_phys: optimizer.into_physical_density(),
        status,
        history,
    })
}

/// Design state of one run. Each call to [`SimpOptimizer::step`] performs one
/// analysis and one design update.
pub struct SimpOptimizer<'a> {
    problem: &'a PreparedProblem,
    params: SimpParameters,
    settings: &'a SolverSettings,
    template: ElementMatrix,
    filter: FilterMatrix,
    solver: Box<dyn LinearSolver>,
    force_free: DVector<f64>,
    design_count: usize,
    x: Vec<f64>,
    x_phys: Vec<f64>,
    iteration: usize,
    status: RunStatus,
    started: Instant,
}

impl<'a> SimpOptimizer<'a> {
    pub fn new(
        problem: &'a PreparedProblem,
        params: &SimpParameters,
        settings: &'a SolverSettings,
    ) -> AbyssResult<SimpOptimizer<'a>> {
        params.validate()?;

        let resolution = &problem.grid.resolution;
        let nele = resolution.element_count();
        let ndof = resolution.dof_count();

        if problem.grid.obstacle.len() != nele {
            return Err(AbyssError::Input(format!(
                "Obstacle mask has {} entries for {nele} elements",
                problem.grid.obstacle.len()
            )));
        }
        if problem.force.len() != ndof || problem.dofs.ndof() != ndof {
            return Err(AbyssError::Input(format!(
                "Force vector ({}) and DOF partition ({}) must cover all {ndof} DOFs",
                problem.force.len(),
                problem.dofs.ndof()
            )));
        }

        let design_count = problem.grid.design_count();
        if design_count == 0 {
            return Err(AbyssError::Solver(
                "Design domain is empty: every element lies outside the solid".to_owned(),
            ));
        }
        if problem.dofs.free.is_empty() {
            return Err(AbyssError::Solver(
                "Every degree of freedom is fixed".to_owned(),
            ));
        }
        if problem.dofs.fixed.is_empty() {
            return Err(AbyssError::Solver(
                "No fixed supports: rigid-body motion is unconstrained".to_owned(),
            ));
        }

        let filter = FilterMatrix::build(resolution, params.rmin)?;
        debug!(nnz = filter.nnz(), rmin = params.rmin, "filter built");

        let force_free = DVector::from_iterator(
            problem.dofs.free.len(),
            problem.dofs.free.iter().map(|dof| problem.force[*dof]),
        );

        let obstacle = &problem.grid.obstacle;
        let x: Vec<f64> = obstacle
            .iter()
            .map(|o| if *o { 0.0 } else { params.volfrac })
            .collect();
        let mut x_phys = filter.apply_density(&x);
        zero_obstacles(&mut x_phys, obstacle);

        let solver = build_linear_solver(
            settings.linear_solver,
            settings.cg_relative_tolerance,
            settings.cg_max_iterations,
        );
        info!(
            elements = nele,
            design_elements = design_count,
            free_dofs = problem.dofs.free.len(),
            solver = solver.name(),
            "optimizer initialized"
        );

        Ok(SimpOptimizer {
            problem,
            params: *params,
            settings,
            template: element_stiffness_template(settings.poisson_ratio),
            filter,
            solver,
            force_free,
            design_count,
            x,
            x_phys,
            iteration: 0,
            status: RunStatus::Initialized,
            started: Instant::now(),
        })
    }

    pub fn status(&self) -> &RunStatus {
        &self.status
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn into_physical_density(self) -> Vec<f64> {
        self.x_phys
    }

    /// Interpolated stiffness of every element
    fn stiffness_scale(&self) -> Vec<f64> {
        let (e0, emin, penal) = (self.settings.e0, self.settings.emin, self.params.penal);
        self.x_phys
            .iter()
            .map(|x| emin + x.powf(penal) * (e0 - emin))
            .collect()
    }

    /// Assembles, restricts and solves the equilibrium system, returning the
    /// full displacement vector with fixed DOFs at zero
    fn solve_displacements(&mut self, scale: &[f64]) -> AbyssResult<DVector<f64>> {
        let resolution = &self.problem.grid.resolution;
        let k = build_total_stiffness_matrix(resolution, &self.template, scale);
        let k_ff = restrict_to_free(&k, &self.problem.dofs)?;
        let u_free = self.solver.solve(&k_ff, &self.force_free)?;

        let mut u = DVector::zeros(resolution.dof_count());
        for (local, dof) in self.problem.dofs.free.iter().enumerate() {
            u[*dof] = u_free[local];
        }
        Ok(u)
    }

    /// `u_e^T KE u_e` of every element
    fn element_compliance(&self, u: &DVector<f64>) -> Vec<f64> {
        let resolution = self.problem.grid.resolution;
        let template = &self.template;
        (0..resolution.element_count())
            .into_par_iter()
            .map(|element| {
                let (ex, ey, ez) = resolution.element_coords(element);
                let dofs = resolution.element_dofs(ex, ey, ez);
                let ue = ElementVector::from_fn(|i, _| u[dofs[i]]);
                ue.dot(&(template * ue))
            })
            .collect()
    }

    /// Performs one iteration and returns its progress report. An error
    /// moves the run to `Failed`; later calls are refused.
    pub fn step(&mut self) -> AbyssResult<ProgressUpdate> {
        if self.status.is_terminal() {
            return Err(AbyssError::Solver(format!(
                "Optimization already finished with status {:?}",
                self.status
            )));
        }
        self.status = RunStatus::Iterating;
        self.iteration += 1;

        let result = self.iterate();
        if let Err(err) = &result {
            self.status = RunStatus::Failed(err.to_string());
        }
        result
    }

    fn iterate(&mut self) -> AbyssResult<ProgressUpdate> {

        let (e0, emin, penal) = (self.settings.e0, self.settings.emin, self.params.penal);
        let problem = self.problem;
        let obstacle = &problem.grid.obstacle;

        let scale = self.stiffness_scale();
        let u = self.solve_displacements(&scale)?;
        let ce = self.element_compliance(&u);

        let objective: f64 = scale.iter().zip(&ce).map(|(s, c)| s * c).sum();
        if !objective.is_finite() {
            return Err(AbyssError::Solver(format!(
                "Compliance became non-finite at iteration {}",
                self.iteration
            )));
        }

        let dc: Vec<f64> = self
            .x_phys
            .iter()
            .zip(&ce)
            .map(|(x, c)| -penal * (e0 - emin) * x.powf(penal - 1.0) * c)
            .collect();
        let dv = vec![1.0; dc.len()];

        let mut dc = self.filter.apply_sensitivity(&dc);
        let mut dv = self.filter.apply_sensitivity(&dv);
        zero_obstacles(&mut dc, obstacle);
        zero_obstacles(&mut dv, obstacle);

        let (x_new, change) = self.optimality_criteria_update(&dc, &dv)?;

        let mut x_phys = self.filter.apply_density(&x_new);
        zero_obstacles(&mut x_phys, obstacle);
        self.x = x_new;
        self.x_phys = x_phys;

        let volume_fraction = design_mean(&self.x_phys, obstacle, self.design_count);
        let update = ProgressUpdate {
            iteration: self.iteration,
            max_iterations: self.params.max_iterations,
            objective,
            volume_fraction,
            change,
            elapsed_seconds: self.started.elapsed().as_secs_f64(),
        };

        info!(
            iteration = update.iteration,
            objective = update.objective,
            volume = update.volume_fraction,
            change = update.change,
            "iteration complete"
        );

        if change <= self.params.tolx {
            self.status = RunStatus::Converged;
        } else if self.iteration >= self.params.max_iterations {
            self.status = RunStatus::MaxIterationsReached;
        }

        Ok(update)
    }

    /// Bisects the Lagrange multiplier of the volume constraint
    ///
    /// # Arguments
    /// * `dc` - Filtered compliance sensitivities, zero on obstacles
    /// * `dv` - Filtered volume sensitivities, zero on obstacles
    ///
    /// # Returns
    /// The new design variables and the largest change from the old ones
    fn optimality_criteria_update(&self, dc: &[f64], dv: &[f64]) -> AbyssResult<(Vec<f64>, f64)> {
        let obstacle = &self.problem.grid.obstacle;

        // nothing to push against: keep the current design
        let driven = dc
            .iter()
            .zip(obstacle)
            .any(|(d, o)| !*o && *d < 0.0);
        if !driven {
            debug!(iteration = self.iteration, "no compliance gradient, design held");
            return Ok((self.x.clone(), 0.0));
        }

        let move_limit = self.settings.move_limit;
        let mut l1 = self.settings.lambda_lower;
        let mut l2 = self.settings.lambda_upper;
        let mut x_new = self.x.clone();
        let mut steps = 0;

        while (l2 - l1) / (l1 + l2) > self.settings.bisection_tolerance {
            if steps >= self.settings.bisection_max_steps {
                return Err(AbyssError::Solver(format!(
                    "Volume constraint bisection did not converge in {steps} steps \
                     (lambda bracket [{l1:e}, {l2:e}])"
                )));
            }
            steps += 1;

            let lmid = 0.5 * (l1 + l2);
            for (e, xe) in x_new.iter_mut().enumerate() {
                if obstacle[e] {
                    *xe = 0.0;
                    continue;
                }
                let old = self.x[e];
                let scaled = old * f64::sqrt(f64::max(-dc[e] / (lmid * dv[e]), 0.0));
                *xe = scaled
                    .min(old + move_limit)
                    .min(1.0)
                    .max(old - move_limit)
                    .max(0.0);
            }

            let mut x_phys = self.filter.apply_density(&x_new);
            zero_obstacles(&mut x_phys, obstacle);
            if design_mean(&x_phys, obstacle, self.design_count) > self.params.volfrac {
                l1 = lmid;
            } else {
                l2 = lmid;
            }
        }

        let change = x_new
            .iter()
            .zip(&self.x)
            .map(|(new, old)| (new - old).abs())
            .fold(0.0, f64::max);

        debug!(iteration = self.iteration, steps, lambda = 0.5 * (l1 + l2), "oc update");
        Ok((x_new, change))
    }
}

fn zero_obstacles(values: &mut [f64], obstacle: &[bool]) {
    for (value, o) in values.iter_mut().zip(obstacle) {
        if *o {
            *value = 0.0;
        }
    }
}

fn design_mean(values: &[f64], obstacle: &[bool], design_count: usize) -> f64 {
    let total: f64 = values
        .iter()
        .zip(obstacle)
        .filter(|(_, o)| !**o)
        .map(|(v, _)| v)
        .sum();
    total / design_count as f64
}
