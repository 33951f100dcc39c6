//! Equal-risk-contribution weights

const ERC_MAX_ITERATIONS: usize = 1_000;
const ERC_TOLERANCE: f64 = 1e-10;

/// Portfolio volatility `√(wᵀΣw)`
pub fn portfolio_volatility(covariance: &[Vec<f64>], weights: &[f64]) -> f64 {
    super::solver::quadratic_form(covariance, weights).max(0.0).sqrt()
}

/// Risk contribution per asset, `wᵢ(Σw)ᵢ / σ`
pub fn risk_contributions(covariance: &[Vec<f64>], weights: &[f64]) -> Vec<f64> {
    let n = weights.len();
    let vol = portfolio_volatility(covariance, weights);
    if vol <= 0.0 {
        return vec![0.0; n];
    }
    (0..n)
        .map(|i| {
            let marginal: f64 = (0..n).map(|j| covariance[i][j] * weights[j]).sum();
            weights[i] * marginal / vol
        })
        .collect()
}

/// Long-only weights whose risk contributions are equal
///
/// Starts from inverse volatility and rescales each weight by the square
/// root of target over actual contribution until contributions agree.
pub fn equal_risk_contribution(covariance: &[Vec<f64>]) -> Vec<f64> {
    let n = covariance.len();
    if n == 0 {
        return Vec::new();
    }

    let mut weights: Vec<f64> = (0..n)
        .map(|i| {
            let vol = covariance[i][i].max(0.0).sqrt();
            if vol > 0.0 {
                1.0 / vol
            } else {
                1.0
            }
        })
        .collect();
    normalize(&mut weights);

    for iteration in 0..ERC_MAX_ITERATIONS {
        let rc = risk_contributions(covariance, &weights);
        let vol = portfolio_volatility(covariance, &weights);
        if vol <= 0.0 {
            break;
        }
        let target = vol / n as f64;

        let max_diff = rc.iter().map(|r| (r - target).abs()).fold(0.0, f64::max);
        if max_diff < ERC_TOLERANCE * vol.max(1e-12) {
            tracing::debug!(iterations = iteration, "Risk parity converged");
            break;
        }

        for i in 0..n {
            if rc[i] > 0.0 {
                weights[i] *= (target / rc[i]).sqrt();
            }
        }
        normalize(&mut weights);
    }

    weights
}

fn normalize(weights: &mut [f64]) {
    let sum: f64 = weights.iter().sum();
    if sum > 0.0 {
        for w in weights.iter_mut() {
            *w /= sum;
        }
    }
}
