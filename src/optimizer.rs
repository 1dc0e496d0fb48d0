//! Long-only mean-variance optimization.
//!
//! - Maximum Sharpe ratio through a pluggable [`SharpeSolver`]
//! - Minimum volatility and target-return portfolios as convex QPs (clarabel)
//! - Sampled efficient frontier, suggestions and a seeded random portfolio cloud
//!
//! Every allocation is long-only and fully invested. A solve whose weights miss the
//! unit sum by more than the strict tolerance is retried once with relaxed solver
//! tolerances before failing with [`PortfolioError::OptimizationFailed`].
//!
//! # Example
//!
//! ```ignore
//! use sena::config::OptimizerSettings;
//! use sena::optimizer::{MeanVarianceProblem, OptimizationEngine};
//!
//! let problem = MeanVarianceProblem::new(
//!     vec!["A".into(), "B".into()],
//!     vec![0.10, 0.06],
//!     vec![vec![0.04, 0.006], vec![0.006, 0.01]],
//!     0.02,
//!     1e-8,
//! )?;
//! let engine = OptimizationEngine::new(OptimizerSettings::default());
//! let best = engine.max_sharpe_allocation(&problem)?;
//! println!("Sharpe {:?}", best.sharpe);
//! ```

use crate::cache::AssetSnapshot;
use crate::config::OptimizerSettings;
use crate::error::{PortfolioError, Result};
use crate::risk::RiskCalculator;
use crate::types::Allocation;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use tracing::{debug, info, warn};

/// Which backend solves the maximum-Sharpe problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SharpeSolverKind {
    /// Projected gradient ascent on the simplex.
    #[default]
    ProjectedGradient,
    /// Quadratic reformulation solved with clarabel.
    ConvexTransform,
}

impl SharpeSolverKind {
    pub fn build(self) -> Box<dyn SharpeSolver> {
        match self {
            SharpeSolverKind::ProjectedGradient => Box::new(ProjectedGradientSolver),
            SharpeSolverKind::ConvexTransform => Box::new(ConvexTransformSolver),
        }
    }
}

/// Non-fatal conditions met while optimizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Diagnostic {
    /// Single asset or singular covariance; a boundary or regularized answer was used.
    Degenerate(String),
    /// No asset beats the risk-free rate; max-Sharpe fell back to min-volatility.
    NoPositiveExcessReturn,
    /// A stage only succeeded with relaxed tolerances.
    RelaxedRetry(String),
    /// A frontier target could not be solved and was skipped.
    SkippedTarget(f64),
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::Degenerate(reason) => {
                write!(f, "{}", PortfolioError::OptimizationDegenerate(reason.clone()))
            }
            Diagnostic::NoPositiveExcessReturn => write!(
                f,
                "no asset has positive excess return; max Sharpe uses the minimum-volatility portfolio"
            ),
            Diagnostic::RelaxedRetry(stage) => write!(f, "{} needed relaxed tolerances", stage),
            Diagnostic::SkippedTarget(target) => {
                write!(f, "frontier target {:.4} skipped", target)
            }
        }
    }
}

/// Tolerances for one solve attempt.
#[derive(Debug, Clone, Copy)]
pub struct SolveAttempt {
    pub max_iterations: u32,
    pub tolerance: f64,
    pub relaxed: bool,
}

/// Validated μ, Σ and risk-free rate.
///
/// Σ is symmetrized on construction. A singular Σ is regularized with a small
/// diagonal epsilon and the problem is marked degenerate.
#[derive(Debug, Clone, PartialEq)]
pub struct MeanVarianceProblem {
    symbols: Vec<String>,
    expected_returns: Vec<f64>,
    covariance: Vec<Vec<f64>>,
    risk_free_rate: f64,
    degenerate: Option<String>,
    fingerprint: String,
}

impl MeanVarianceProblem {
    pub fn new(
        symbols: Vec<String>,
        expected_returns: Vec<f64>,
        covariance: Vec<Vec<f64>>,
        risk_free_rate: f64,
        regularization_epsilon: f64,
    ) -> Result<Self> {
        let n = symbols.len();
        if n == 0 {
            return Err(PortfolioError::InvalidInput(
                "Need at least one asset to optimize".to_string(),
            ));
        }
        if expected_returns.len() != n {
            return Err(PortfolioError::InvalidInput(
                "Expected returns length must match number of symbols".to_string(),
            ));
        }
        if covariance.len() != n || covariance.iter().any(|row| row.len() != n) {
            return Err(PortfolioError::InvalidInput(
                "Covariance matrix must be square and match number of symbols".to_string(),
            ));
        }
        if expected_returns.iter().any(|v| !v.is_finite())
            || covariance.iter().flatten().any(|v| !v.is_finite())
            || !risk_free_rate.is_finite()
        {
            return Err(PortfolioError::InvalidInput(
                "Optimizer inputs must be finite".to_string(),
            ));
        }

        let fingerprint = fingerprint(&symbols, &expected_returns, &covariance, risk_free_rate);

        let mut sym = vec![vec![0.0; n]; n];
        for i in 0..n {
            for j in 0..n {
                sym[i][j] = 0.5 * (covariance[i][j] + covariance[j][i]);
            }
        }

        let degenerate = if n == 1 {
            Some("single asset".to_string())
        } else if !is_positive_definite(&sym) {
            for (i, row) in sym.iter_mut().enumerate() {
                row[i] += regularization_epsilon;
            }
            Some(format!(
                "covariance matrix is singular; regularized with epsilon {:e}",
                regularization_epsilon
            ))
        } else {
            None
        };

        Ok(Self {
            symbols,
            expected_returns,
            covariance: sym,
            risk_free_rate,
            degenerate,
            fingerprint,
        })
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn expected_returns(&self) -> &[f64] {
        &self.expected_returns
    }

    pub fn covariance(&self) -> &[Vec<f64>] {
        &self.covariance
    }

    pub fn risk_free_rate(&self) -> f64 {
        self.risk_free_rate
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn degenerate(&self) -> Option<&str> {
        self.degenerate.as_deref()
    }

    /// SHA-256 over symbols, μ, Σ and rf as given (before regularization).
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn portfolio_return(&self, w: &[f64]) -> f64 {
        w.iter().zip(&self.expected_returns).map(|(a, b)| a * b).sum()
    }

    pub fn portfolio_variance(&self, w: &[f64]) -> f64 {
        let n = self.len();
        let mut variance = 0.0;
        for i in 0..n {
            for j in 0..n {
                variance += w[i] * w[j] * self.covariance[i][j];
            }
        }
        variance.max(0.0)
    }

    pub fn portfolio_volatility(&self, w: &[f64]) -> f64 {
        self.portfolio_variance(w).sqrt()
    }

    /// `None` when the portfolio has zero volatility.
    pub fn sharpe(&self, w: &[f64]) -> Option<f64> {
        let vol = self.portfolio_volatility(w);
        if vol > 1e-12 {
            Some((self.portfolio_return(w) - self.risk_free_rate) / vol)
        } else {
            None
        }
    }

    fn excess_returns(&self) -> Vec<f64> {
        self.expected_returns
            .iter()
            .map(|r| r - self.risk_free_rate)
            .collect()
    }

    /// Metrics for an allocation over this problem's symbols.
    pub fn evaluate(&self, weights: &Allocation) -> FrontierPoint {
        let w = weights.to_vector(&self.symbols);
        FrontierPoint {
            expected_return: self.portfolio_return(&w),
            volatility: self.portfolio_volatility(&w),
            sharpe: self.sharpe(&w),
            weights: weights.clone(),
            efficient: true,
        }
    }
}

/// A portfolio on (or near) the frontier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontierPoint {
    pub expected_return: f64,
    pub volatility: f64,
    pub sharpe: Option<f64>,
    pub weights: Allocation,
    /// On the upper branch: return at least that of the minimum-volatility portfolio.
    pub efficient: bool,
}

/// A labelled candidate allocation for side-by-side comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub label: String,
    pub point: FrontierPoint,
}

/// An asset left out of optimization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DroppedAsset {
    pub symbol: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizationResult {
    pub symbols: Vec<String>,
    pub risk_free_rate: f64,
    pub max_sharpe: FrontierPoint,
    pub min_volatility: FrontierPoint,
    /// Ascending volatility.
    pub frontier: Vec<FrontierPoint>,
    pub dropped: Vec<DroppedAsset>,
    pub diagnostics: Vec<Diagnostic>,
    pub solver: String,
    /// SHA-256 of μ, Σ, rf and the frontier size.
    pub fingerprint: String,
    #[serde(skip)]
    pub problem: MeanVarianceProblem,
}

impl OptimizationResult {
    pub fn is_degenerate(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| matches!(d, Diagnostic::Degenerate(_)))
    }
}

/// Backend for the maximum-Sharpe problem.
pub trait SharpeSolver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Weight vector aligned with `problem.symbols()`. Called only when at least
    /// one asset has positive excess return.
    fn solve(
        &self,
        problem: &MeanVarianceProblem,
        attempt: &SolveAttempt,
    ) -> std::result::Result<Vec<f64>, String>;
}

/// Projected gradient ascent on the Sharpe ratio from equal weights, with
/// backtracking line search and a fixed iteration cap.
pub struct ProjectedGradientSolver;

impl SharpeSolver for ProjectedGradientSolver {
    fn name(&self) -> &'static str {
        "projected-gradient"
    }

    fn solve(
        &self,
        problem: &MeanVarianceProblem,
        attempt: &SolveAttempt,
    ) -> std::result::Result<Vec<f64>, String> {
        let n = problem.len();
        let mut w = vec![1.0 / n as f64; n];
        let mut f = sharpe_objective(problem, &w);
        if !f.is_finite() {
            return Err("zero-volatility starting point".to_string());
        }

        let mut step = 1.0;
        for iteration in 0..attempt.max_iterations {
            let grad = sharpe_gradient(problem, &w);
            let mut trial = step;
            let mut accepted = None;
            for _ in 0..60 {
                let moved: Vec<f64> = w.iter().zip(&grad).map(|(wi, gi)| wi + trial * gi).collect();
                let candidate = project_to_simplex(&moved);
                let fc = sharpe_objective(problem, &candidate);
                if fc.is_finite() && fc > f {
                    accepted = Some((candidate, fc));
                    break;
                }
                trial *= 0.5;
            }

            let Some((candidate, fc)) = accepted else {
                debug!("Projected gradient stationary after {} iterations", iteration);
                return Ok(w);
            };
            let shift = w
                .iter()
                .zip(&candidate)
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f64::max);
            let gain = fc - f;
            w = candidate;
            f = fc;
            step = trial * 2.0;
            if shift < attempt.tolerance * 1e-3 && gain < attempt.tolerance * 1e-6 {
                debug!("Projected gradient converged after {} iterations", iteration + 1);
                return Ok(w);
            }
        }
        Ok(w)
    }
}

/// Solves `min yᵀΣy s.t. (μ − rf)ᵀy = 1, y ≥ 0` and normalizes y.
pub struct ConvexTransformSolver;

impl SharpeSolver for ConvexTransformSolver {
    fn name(&self) -> &'static str {
        "convex-transform"
    }

    fn solve(
        &self,
        problem: &MeanVarianceProblem,
        attempt: &SolveAttempt,
    ) -> std::result::Result<Vec<f64>, String> {
        let y = solve_long_only_qp(
            problem.covariance(),
            &[(problem.excess_returns(), 1.0)],
            attempt,
        )?;
        let total: f64 = y.iter().map(|v| v.max(0.0)).sum();
        if total <= 0.0 {
            return Err("transformed solution has no positive weight".to_string());
        }
        Ok(y.iter().map(|v| v.max(0.0) / total).collect())
    }
}

fn sharpe_objective(problem: &MeanVarianceProblem, w: &[f64]) -> f64 {
    let vol = problem.portfolio_volatility(w);
    if vol <= 0.0 {
        return f64::NEG_INFINITY;
    }
    (problem.portfolio_return(w) - problem.risk_free_rate) / vol
}

/// ∇S = μ/σ − (μᵀw − rf)·Σw/σ³
fn sharpe_gradient(problem: &MeanVarianceProblem, w: &[f64]) -> Vec<f64> {
    let n = problem.len();
    let cov = problem.covariance();
    let sigma_w: Vec<f64> = (0..n)
        .map(|i| (0..n).map(|j| cov[i][j] * w[j]).sum())
        .collect();
    let variance: f64 = w.iter().zip(&sigma_w).map(|(a, b)| a * b).sum();
    let vol = variance.max(1e-300).sqrt();
    let excess = problem.portfolio_return(w) - problem.risk_free_rate;
    problem
        .expected_returns()
        .iter()
        .zip(&sigma_w)
        .map(|(mu, sw)| mu / vol - excess * sw / (vol * variance.max(1e-300)))
        .collect()
}

/// Euclidean projection onto `{w : w ≥ 0, Σw = 1}`.
pub fn project_to_simplex(v: &[f64]) -> Vec<f64> {
    let mut sorted = v.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal));
    let mut cumsum = 0.0;
    let mut theta = 0.0;
    for (i, &u) in sorted.iter().enumerate() {
        cumsum += u;
        let t = (cumsum - 1.0) / (i + 1) as f64;
        if u - t > 0.0 {
            theta = t;
        }
    }
    v.iter().map(|x| (x - theta).max(0.0)).collect()
}

fn is_positive_definite(cov: &[Vec<f64>]) -> bool {
    let n = cov.len();
    let scale = (0..n).map(|i| cov[i][i]).fold(0.0, f64::max);
    if scale <= 0.0 {
        return false;
    }
    let mut l = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..=i {
            let mut sum = cov[i][j];
            for k in 0..j {
                sum -= l[i][k] * l[j][k];
            }
            if i == j {
                if sum <= 1e-12 * scale {
                    return false;
                }
                l[i][i] = sum.sqrt();
            } else {
                l[i][j] = sum / l[j][j];
            }
        }
    }
    true
}

fn fingerprint(symbols: &[String], mu: &[f64], cov: &[Vec<f64>], rf: f64) -> String {
    let mut hasher = Sha256::new();
    for s in symbols {
        hasher.update(s.as_bytes());
        hasher.update([0u8]);
    }
    for v in mu.iter().chain(cov.iter().flatten()) {
        hasher.update(v.to_le_bytes());
    }
    hasher.update(rf.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

/// Solve `min ½ wᵀΣw s.t. Aw = b, w ≥ 0` with clarabel.
fn solve_long_only_qp(
    cov: &[Vec<f64>],
    equalities: &[(Vec<f64>, f64)],
    attempt: &SolveAttempt,
) -> std::result::Result<Vec<f64>, String> {
    use clarabel::algebra::*;
    use clarabel::solver::*;

    let n = cov.len();
    let m = equalities.len();

    // P: upper triangle in CSC form
    let mut p_colptr = vec![0];
    let mut p_rowval = Vec::new();
    let mut p_nzval = Vec::new();
    for j in 0..n {
        for (i, row) in cov.iter().enumerate().take(j + 1) {
            let val = row[j];
            if val != 0.0 {
                p_rowval.push(i);
                p_nzval.push(val);
            }
        }
        p_colptr.push(p_nzval.len());
    }
    let p = CscMatrix::new(n, n, p_colptr, p_rowval, p_nzval);
    let q = vec![0.0; n];

    // A: equality rows, then -I for w >= 0
    let mut a_colptr = vec![0];
    let mut a_rowval = Vec::new();
    let mut a_nzval = Vec::new();
    for j in 0..n {
        for (row, (coeffs, _)) in equalities.iter().enumerate() {
            if coeffs[j] != 0.0 {
                a_rowval.push(row);
                a_nzval.push(coeffs[j]);
            }
        }
        a_rowval.push(m + j);
        a_nzval.push(-1.0);
        a_colptr.push(a_nzval.len());
    }
    let a = CscMatrix::new(m + n, n, a_colptr, a_rowval, a_nzval);

    let mut b: Vec<f64> = equalities.iter().map(|(_, rhs)| *rhs).collect();
    b.extend(vec![0.0; n]);

    let cones = [ZeroConeT(m), NonnegativeConeT(n)];

    let mut builder = DefaultSettingsBuilder::default();
    builder.max_iter(attempt.max_iterations).verbose(false);
    if attempt.relaxed {
        builder
            .tol_gap_abs(attempt.tolerance)
            .tol_gap_rel(attempt.tolerance)
            .tol_feas(attempt.tolerance);
    }
    let settings = builder
        .build()
        .map_err(|e| format!("invalid solver settings: {}", e))?;

    let mut solver = DefaultSolver::new(&p, &q, &a, &b, &cones, settings)
        .map_err(|e| format!("failed to create solver: {:?}", e))?;
    solver.solve();

    let accepted = matches!(solver.solution.status, SolverStatus::Solved)
        || (attempt.relaxed && matches!(solver.solution.status, SolverStatus::AlmostSolved));
    if !accepted {
        return Err(format!("solver status {:?}", solver.solution.status));
    }
    Ok(solver.solution.x.clone())
}

fn to_allocation(
    symbols: &[String],
    weights: &[f64],
    tolerance: f64,
) -> std::result::Result<Allocation, String> {
    Allocation::from_vector(symbols, weights, tolerance).map_err(|e| e.to_string())
}

fn linspace(lo: f64, hi: f64, k: usize) -> Vec<f64> {
    match k {
        0 => Vec::new(),
        1 => vec![lo],
        _ => (0..k)
            .map(|i| lo + (hi - lo) * i as f64 / (k - 1) as f64)
            .collect(),
    }
}

pub struct OptimizationEngine {
    settings: OptimizerSettings,
    calculator: RiskCalculator,
    solver: Box<dyn SharpeSolver>,
}

impl OptimizationEngine {
    pub fn new(settings: OptimizerSettings) -> Self {
        let solver = settings.sharpe_solver.build();
        Self {
            settings,
            calculator: RiskCalculator::default(),
            solver,
        }
    }

    pub fn with_calculator(mut self, calculator: RiskCalculator) -> Self {
        self.calculator = calculator;
        self
    }

    pub fn with_solver(mut self, solver: Box<dyn SharpeSolver>) -> Self {
        self.solver = solver;
        self
    }

    pub fn settings(&self) -> &OptimizerSettings {
        &self.settings
    }

    fn strict(&self) -> SolveAttempt {
        SolveAttempt {
            max_iterations: self.settings.max_iterations,
            tolerance: self.settings.tolerance,
            relaxed: false,
        }
    }

    fn relaxed(&self) -> SolveAttempt {
        SolveAttempt {
            max_iterations: self.settings.max_iterations,
            tolerance: self.settings.relaxed_tolerance,
            relaxed: true,
        }
    }

    /// Run `solve` strictly, then once relaxed. Returns whether the relaxed pass
    /// was needed.
    fn with_retry<F>(&self, stage: &str, solve: F) -> Result<(Allocation, bool)>
    where
        F: Fn(&SolveAttempt) -> std::result::Result<Allocation, String>,
    {
        match solve(&self.strict()) {
            Ok(allocation) => Ok((allocation, false)),
            Err(first) => {
                warn!("{} failed ({}); retrying with relaxed tolerance", stage, first);
                match solve(&self.relaxed()) {
                    Ok(allocation) => Ok((allocation, true)),
                    Err(second) => Err(PortfolioError::optimization_failed(
                        stage,
                        format!("{}; relaxed retry: {}", first, second),
                    )),
                }
            }
        }
    }

    fn min_volatility_inner(
        &self,
        problem: &MeanVarianceProblem,
    ) -> Result<(FrontierPoint, Vec<Diagnostic>)> {
        let mut diagnostics = Vec::new();
        if problem.len() == 1 {
            return Ok((problem.evaluate(&Allocation::single(problem.symbols()[0].clone())), diagnostics));
        }
        let ones = vec![1.0; problem.len()];
        let (allocation, relaxed) = self.with_retry("min-volatility", |attempt| {
            let w = solve_long_only_qp(problem.covariance(), &[(ones.clone(), 1.0)], attempt)?;
            to_allocation(problem.symbols(), &w, attempt.tolerance)
        })?;
        if relaxed {
            diagnostics.push(Diagnostic::RelaxedRetry("min-volatility".to_string()));
        }
        Ok((problem.evaluate(&allocation), diagnostics))
    }

    fn max_sharpe_inner(
        &self,
        problem: &MeanVarianceProblem,
    ) -> Result<(FrontierPoint, Vec<Diagnostic>)> {
        if problem.len() == 1 {
            return self.min_volatility_inner(problem);
        }
        if problem.excess_returns().iter().all(|&r| r <= 0.0) {
            info!("No asset beats the risk-free rate; using minimum volatility");
            let (point, mut diagnostics) = self.min_volatility_inner(problem)?;
            diagnostics.push(Diagnostic::NoPositiveExcessReturn);
            return Ok((point, diagnostics));
        }

        let mut diagnostics = Vec::new();
        let (allocation, relaxed) = self.with_retry("max-sharpe", |attempt| {
            let w = self.solver.solve(problem, attempt)?;
            to_allocation(problem.symbols(), &w, attempt.tolerance)
        })?;
        if relaxed {
            diagnostics.push(Diagnostic::RelaxedRetry("max-sharpe".to_string()));
        }
        Ok((problem.evaluate(&allocation), diagnostics))
    }

    fn frontier_inner(
        &self,
        problem: &MeanVarianceProblem,
        points: usize,
        min_volatility_return: f64,
    ) -> (Vec<FrontierPoint>, Vec<Diagnostic>) {
        if problem.len() == 1 {
            let point = problem.evaluate(&Allocation::single(problem.symbols()[0].clone()));
            return (if points > 0 { vec![point] } else { Vec::new() }, Vec::new());
        }

        let mu = problem.expected_returns();
        let lo = mu.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = mu.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let targets = if hi - lo < 1e-12 {
            linspace(lo, lo, points.min(1))
        } else {
            linspace(lo, hi, points)
        };

        let ones = vec![1.0; problem.len()];
        self.trace_frontier(problem, &targets, min_volatility_return, |target, attempt| {
            let w = solve_long_only_qp(
                problem.covariance(),
                &[(ones.clone(), 1.0), (mu.to_vec(), target)],
                attempt,
            )?;
            to_allocation(problem.symbols(), &w, attempt.tolerance)
        })
    }

    /// Solve every target return with `solve`, skipping the ones that fail both
    /// attempts. A relaxed retry is reported once for the whole frontier.
    fn trace_frontier<F>(
        &self,
        problem: &MeanVarianceProblem,
        targets: &[f64],
        min_volatility_return: f64,
        solve: F,
    ) -> (Vec<FrontierPoint>, Vec<Diagnostic>)
    where
        F: Fn(f64, &SolveAttempt) -> std::result::Result<Allocation, String>,
    {
        let mut diagnostics = Vec::new();
        let mut relaxed_any = false;
        let mut frontier = Vec::with_capacity(targets.len());
        for &target in targets {
            match self.with_retry("frontier", |attempt| solve(target, attempt)) {
                Ok((allocation, relaxed)) => {
                    relaxed_any |= relaxed;
                    let mut point = problem.evaluate(&allocation);
                    point.efficient = point.expected_return >= min_volatility_return - 1e-9;
                    frontier.push(point);
                }
                Err(e) => {
                    debug!("Skipping frontier target {:.6}: {}", target, e);
                    diagnostics.push(Diagnostic::SkippedTarget(target));
                }
            }
        }
        if relaxed_any {
            diagnostics.push(Diagnostic::RelaxedRetry("frontier".to_string()));
        }

        frontier.sort_by(|a, b| {
            a.volatility
                .partial_cmp(&b.volatility)
                .unwrap_or(Ordering::Equal)
                .then(
                    a.expected_return
                        .partial_cmp(&b.expected_return)
                        .unwrap_or(Ordering::Equal),
                )
        });
        (frontier, diagnostics)
    }

    /// Long-only portfolio with the highest Sharpe ratio.
    pub fn max_sharpe_allocation(&self, problem: &MeanVarianceProblem) -> Result<FrontierPoint> {
        self.max_sharpe_inner(problem).map(|(p, _)| p)
    }

    /// Long-only portfolio with the lowest volatility.
    pub fn min_volatility_allocation(&self, problem: &MeanVarianceProblem) -> Result<FrontierPoint> {
        self.min_volatility_inner(problem).map(|(p, _)| p)
    }

    /// Minimum-volatility portfolios for `points` target returns evenly spaced
    /// between the lowest and highest asset return, sorted by volatility.
    /// Targets the solver cannot meet are skipped.
    pub fn sample_frontier(
        &self,
        problem: &MeanVarianceProblem,
        points: usize,
    ) -> Result<Vec<FrontierPoint>> {
        let (min_vol, _) = self.min_volatility_inner(problem)?;
        Ok(self.frontier_inner(problem, points, min_vol.expected_return).0)
    }

    /// Optimize a problem built directly from μ and Σ.
    pub fn optimize_problem(
        &self,
        problem: MeanVarianceProblem,
        frontier_points: usize,
    ) -> Result<OptimizationResult> {
        let mut diagnostics = Vec::new();
        if let Some(reason) = problem.degenerate() {
            warn!("Degenerate optimization input: {}", reason);
            diagnostics.push(Diagnostic::Degenerate(reason.to_string()));
        }

        let (min_volatility, d) = self.min_volatility_inner(&problem)?;
        diagnostics.extend(d);
        let (max_sharpe, d) = self.max_sharpe_inner(&problem)?;
        diagnostics.extend(d);
        let (frontier, d) =
            self.frontier_inner(&problem, frontier_points, min_volatility.expected_return);
        diagnostics.extend(d);

        let mut hasher = Sha256::new();
        hasher.update(problem.fingerprint().as_bytes());
        hasher.update((frontier_points as u64).to_le_bytes());
        let fingerprint = format!("{:x}", hasher.finalize());

        info!(
            "Optimized {} assets: max Sharpe {:?}, min vol {:.4}, {} frontier points",
            problem.len(),
            max_sharpe.sharpe,
            min_volatility.volatility,
            frontier.len()
        );

        Ok(OptimizationResult {
            symbols: problem.symbols().to_vec(),
            risk_free_rate: problem.risk_free_rate(),
            max_sharpe,
            min_volatility,
            frontier,
            dropped: Vec::new(),
            diagnostics,
            solver: self.solver.name().to_string(),
            fingerprint,
            problem,
        })
    }

    /// Estimate μ and Σ from asset snapshots and optimize.
    ///
    /// Assets with less than the minimum history are dropped and reported.
    pub fn optimize(
        &self,
        assets: &[&AssetSnapshot],
        risk_free_rate: f64,
        frontier_points: usize,
    ) -> Result<OptimizationResult> {
        let mut dropped = Vec::new();
        let mut histories = Vec::new();
        for asset in assets {
            if asset.history.len() < self.settings.min_history_days {
                let reason = format!(
                    "{} prices, need {}",
                    asset.history.len(),
                    self.settings.min_history_days
                );
                warn!("Dropping {} from optimization: {}", asset.symbol, reason);
                dropped.push(DroppedAsset {
                    symbol: asset.symbol.clone(),
                    reason,
                });
            } else {
                histories.push((asset.symbol.clone(), asset.history.clone()));
            }
        }

        if histories.is_empty() {
            return Err(PortfolioError::optimization_failed(
                "inputs",
                "no asset has sufficient price history",
            ));
        }

        let inputs = self.calculator.estimate_inputs(&histories)?;
        let problem = MeanVarianceProblem::new(
            inputs.symbols,
            inputs.expected_returns,
            inputs.covariance,
            risk_free_rate,
            self.settings.regularization_epsilon,
        )?;

        let mut result = self.optimize_problem(problem, frontier_points)?;
        result.dropped = dropped;
        Ok(result)
    }

    /// Max-Sharpe, min-volatility, equal-weight and (when given) current portfolio
    /// metrics side by side. Current weights outside the optimized universe are
    /// ignored and the rest renormalized.
    pub fn suggestions(
        &self,
        result: &OptimizationResult,
        current: Option<&Allocation>,
    ) -> Vec<Suggestion> {
        let problem = &result.problem;
        let mut suggestions = vec![
            Suggestion {
                label: "max_sharpe".to_string(),
                point: result.max_sharpe.clone(),
            },
            Suggestion {
                label: "min_volatility".to_string(),
                point: result.min_volatility.clone(),
            },
        ];

        if let Ok(equal) = Allocation::equal_weight(problem.symbols()) {
            suggestions.push(Suggestion {
                label: "equal_weight".to_string(),
                point: problem.evaluate(&equal),
            });
        }

        if let Some(current) = current {
            let overlap = problem
                .symbols()
                .iter()
                .map(|s| (s.clone(), current.weight(s)));
            match Allocation::from_values(overlap) {
                Ok(restricted) => suggestions.push(Suggestion {
                    label: "current".to_string(),
                    point: problem.evaluate(&restricted),
                }),
                Err(e) => debug!("Current allocation not comparable: {}", e),
            }
        }
        suggestions
    }

    /// Random long-only portfolios for a frontier scatter; deterministic per seed.
    pub fn random_portfolios(
        &self,
        problem: &MeanVarianceProblem,
        count: usize,
        seed: u64,
    ) -> Vec<FrontierPoint> {
        let mut rng = StdRng::seed_from_u64(seed);
        let n = problem.len();
        let mut points = Vec::with_capacity(count);
        for _ in 0..count {
            let raw: Vec<f64> = (0..n).map(|_| rng.gen::<f64>()).collect();
            let total: f64 = raw.iter().sum();
            if total <= 0.0 {
                continue;
            }
            let w: Vec<f64> = raw.iter().map(|v| v / total).collect();
            if let Ok(allocation) = Allocation::from_vector(problem.symbols(), &w, 1e-9) {
                let mut point = problem.evaluate(&allocation);
                point.efficient = false;
                points.push(point);
            }
        }
        points
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WEIGHT_TOLERANCE;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Arc;

    fn three_assets() -> MeanVarianceProblem {
        MeanVarianceProblem::new(
            vec!["A".into(), "B".into(), "C".into()],
            vec![0.12, 0.08, 0.05],
            vec![
                vec![0.09, 0.01, 0.004],
                vec![0.01, 0.04, 0.002],
                vec![0.004, 0.002, 0.01],
            ],
            0.02,
            1e-8,
        )
        .unwrap()
    }

    fn engine() -> OptimizationEngine {
        OptimizationEngine::new(OptimizerSettings::default())
    }

    fn assert_valid(a: &Allocation) {
        assert!((a.total() - 1.0).abs() <= WEIGHT_TOLERANCE);
        for (_, w) in a.iter() {
            assert!((0.0..=1.0).contains(&w));
        }
    }

    #[test]
    fn test_simplex_projection() {
        let p = project_to_simplex(&[0.5, 0.5, 0.5]);
        assert!(p.iter().all(|&v| (v - 1.0 / 3.0).abs() < 1e-12));
        let p = project_to_simplex(&[2.0, 0.0, -1.0]);
        assert_eq!(p, vec![1.0, 0.0, 0.0]);
        let total: f64 = project_to_simplex(&[0.3, -0.2, 0.9, 0.1]).iter().sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_min_volatility_beats_every_asset() {
        let problem = three_assets();
        let point = engine().min_volatility_allocation(&problem).unwrap();
        assert_valid(&point.weights);
        for i in 0..3 {
            assert!(point.volatility <= problem.covariance()[i][i].sqrt() + 1e-9);
        }
    }

    #[test]
    fn test_single_asset_is_degenerate_point() {
        let problem = MeanVarianceProblem::new(
            vec!["ONLY".into()],
            vec![0.07],
            vec![vec![0.0625]],
            0.02,
            1e-8,
        )
        .unwrap();
        let engine = engine();
        let point = engine.min_volatility_allocation(&problem).unwrap();
        assert_eq!(point.weights.weight("ONLY"), 1.0);
        assert!((point.volatility - 0.25).abs() < 1e-12);

        let result = engine.optimize_problem(problem, 10).unwrap();
        assert!(result.is_degenerate());
        assert_eq!(result.frontier.len(), 1);
        assert_eq!(result.max_sharpe.weights.weight("ONLY"), 1.0);
    }

    #[test]
    fn test_solvers_agree_on_max_sharpe() {
        let problem = three_assets();
        let pg = engine().max_sharpe_allocation(&problem).unwrap();
        let ct = engine()
            .with_solver(Box::new(ConvexTransformSolver))
            .max_sharpe_allocation(&problem)
            .unwrap();
        assert_valid(&pg.weights);
        assert_valid(&ct.weights);
        assert!((pg.sharpe.unwrap() - ct.sharpe.unwrap()).abs() < 1e-3);

        let equal = problem.evaluate(&Allocation::equal_weight(problem.symbols()).unwrap());
        assert!(pg.sharpe.unwrap() >= equal.sharpe.unwrap() - 1e-9);
    }

    #[test]
    fn test_negative_excess_falls_back_to_min_volatility() {
        let problem = MeanVarianceProblem::new(
            vec!["A".into(), "B".into()],
            vec![0.01, 0.015],
            vec![vec![0.04, 0.0], vec![0.0, 0.09]],
            0.05,
            1e-8,
        )
        .unwrap();
        let result = engine().optimize_problem(problem, 5).unwrap();
        assert!(result
            .diagnostics
            .contains(&Diagnostic::NoPositiveExcessReturn));
        assert_eq!(result.max_sharpe.weights, result.min_volatility.weights);
    }

    #[test]
    fn test_singular_covariance_is_regularized() {
        let problem = MeanVarianceProblem::new(
            vec!["A".into(), "A2".into()],
            vec![0.10, 0.10],
            vec![vec![0.04, 0.04], vec![0.04, 0.04]],
            0.02,
            1e-8,
        )
        .unwrap();
        assert!(problem.degenerate().is_some());
        let result = engine().optimize_problem(problem, 5).unwrap();
        assert!(result.is_degenerate());
        assert_valid(&result.max_sharpe.weights);
        assert_valid(&result.min_volatility.weights);
    }

    #[test]
    fn test_frontier_sorted_and_efficient_branch_monotone() {
        let problem = three_assets();
        let frontier = engine().sample_frontier(&problem, 20).unwrap();
        assert!(frontier.len() >= 15);
        assert!(frontier
            .windows(2)
            .all(|w| w[0].volatility <= w[1].volatility));

        let mut efficient: Vec<&FrontierPoint> = frontier.iter().filter(|p| p.efficient).collect();
        efficient.sort_by(|a, b| a.expected_return.partial_cmp(&b.expected_return).unwrap());
        for pair in efficient.windows(2) {
            assert!(pair[1].volatility >= pair[0].volatility - 1e-4);
        }
        for p in &frontier {
            assert_valid(&p.weights);
        }
    }

    #[test]
    fn test_frontier_is_idempotent() {
        let problem = three_assets();
        let engine = engine();
        let first = engine.sample_frontier(&problem, 12).unwrap();
        let second = engine.sample_frontier(&problem, 12).unwrap();
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            assert!((a.volatility - b.volatility).abs() < 1e-12);
            assert!((a.expected_return - b.expected_return).abs() < 1e-12);
        }
    }

    #[test]
    fn test_fingerprint_depends_on_inputs() {
        let a = three_assets();
        let b = three_assets();
        assert_eq!(a.fingerprint(), b.fingerprint());
        let c = MeanVarianceProblem::new(
            a.symbols().to_vec(),
            a.expected_returns().to_vec(),
            a.covariance().to_vec(),
            0.03,
            1e-8,
        )
        .unwrap();
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_suggestions_and_random_cloud() {
        let problem = three_assets();
        let engine = engine();
        let result = engine.optimize_problem(problem.clone(), 5).unwrap();
        let mut current = std::collections::BTreeMap::new();
        current.insert("A".to_string(), 0.5);
        current.insert("B".to_string(), 0.3);
        current.insert("OTHER".to_string(), 0.2);
        let current = Allocation::new(current).unwrap();

        let suggestions = engine.suggestions(&result, Some(&current));
        let labels: Vec<&str> = suggestions.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["max_sharpe", "min_volatility", "equal_weight", "current"]);
        assert!((suggestions[3].point.weights.weight("A") - 0.625).abs() < 1e-12);

        let cloud = engine.random_portfolios(&problem, 50, 7);
        let again = engine.random_portfolios(&problem, 50, 7);
        assert_eq!(cloud.len(), 50);
        assert_eq!(cloud, again);
        let best = result.max_sharpe.sharpe.unwrap();
        assert!(cloud.iter().all(|p| p.sharpe.unwrap() <= best + 1e-6));
    }

    /// Fails every strict attempt, and the relaxed ones too when `always_fail`.
    struct StrictFailingSolver {
        calls: Arc<AtomicUsize>,
        always_fail: bool,
    }

    impl SharpeSolver for StrictFailingSolver {
        fn name(&self) -> &'static str {
            "strict-failing"
        }

        fn solve(
            &self,
            problem: &MeanVarianceProblem,
            attempt: &SolveAttempt,
        ) -> std::result::Result<Vec<f64>, String> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            if self.always_fail || !attempt.relaxed {
                return Err("did not converge".to_string());
            }
            Ok(vec![1.0 / problem.len() as f64; problem.len()])
        }
    }

    fn strict_failing(always_fail: bool) -> (OptimizationEngine, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let engine = engine().with_solver(Box::new(StrictFailingSolver {
            calls: calls.clone(),
            always_fail,
        }));
        (engine, calls)
    }

    #[test]
    fn test_relaxed_retry_rescues_max_sharpe() {
        let (engine, calls) = strict_failing(false);
        let result = engine.optimize_problem(three_assets(), 3).unwrap();
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 2);
        assert!(result
            .diagnostics
            .contains(&Diagnostic::RelaxedRetry("max-sharpe".to_string())));
        assert_eq!(result.solver, "strict-failing");
        assert!((result.max_sharpe.weights.weight("A") - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_failed_relaxed_retry_names_the_stage() {
        let (engine, calls) = strict_failing(true);
        let err = engine.optimize_problem(three_assets(), 3).unwrap_err();
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 2);
        match err {
            PortfolioError::OptimizationFailed { stage, reason } => {
                assert_eq!(stage, "max-sharpe");
                assert!(reason.contains("relaxed retry"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_frontier_reports_relaxed_retry_once() {
        let problem = three_assets();
        let engine = engine();
        let calls = AtomicUsize::new(0);
        let (frontier, diagnostics) =
            engine.trace_frontier(&problem, &[0.06, 0.08, 0.11], 0.06, |target, attempt| {
                calls.fetch_add(1, AtomicOrdering::SeqCst);
                if target > 0.1 || !attempt.relaxed {
                    return Err("did not converge".to_string());
                }
                Allocation::equal_weight(problem.symbols()).map_err(|e| e.to_string())
            });
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 6);
        assert_eq!(frontier.len(), 2);
        assert_eq!(
            diagnostics,
            vec![
                Diagnostic::SkippedTarget(0.11),
                Diagnostic::RelaxedRetry("frontier".to_string()),
            ]
        );
    }
}
