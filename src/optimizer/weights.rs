//! Weight post-processing shared by every optimizer

/// Sums below this are treated as an all-zero vector
pub const DEGENERATE_EPS: f64 = 1e-12;

/// Result of clipping and renormalising a raw weight vector
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub weights: Vec<f64>,
    /// Raw vector summed to ~0 and was replaced by equal weights
    pub degenerate: bool,
}

pub fn equal_weights(n: usize) -> Vec<f64> {
    if n == 0 {
        return Vec::new();
    }
    vec![1.0 / n as f64; n]
}

/// Whether {sum(w) = 1, 0 <= w <= cap} has more than one point
pub fn cap_is_feasible(n: usize, cap: f64) -> bool {
    n as f64 * cap > 1.0 + DEGENERATE_EPS
}

/// Zero out non-finite and negative entries, then rescale to sum to 1.
///
/// Falls back to equal weights when nothing positive remains.
pub fn clip_and_normalize(raw: &[f64]) -> Normalized {
    let clipped: Vec<f64> = raw
        .iter()
        .map(|&w| if w.is_finite() && w > 0.0 { w } else { 0.0 })
        .collect();
    let total: f64 = clipped.iter().sum();

    if total <= DEGENERATE_EPS {
        return Normalized {
            weights: equal_weights(raw.len()),
            degenerate: true,
        };
    }

    Normalized {
        weights: clipped.into_iter().map(|w| w / total).collect(),
        degenerate: false,
    }
}

/// Project a normalised long-only vector onto `w_i <= cap` by water-filling:
/// capped mass is redistributed over the uncapped names in proportion to
/// their weight (equally when they are all zero).
///
/// Returns equal weights when the cap admits no other solution.
pub fn enforce_cap(weights: &[f64], cap: f64) -> Vec<f64> {
    let n = weights.len();
    if !cap_is_feasible(n, cap) {
        return equal_weights(n);
    }

    let mut w = weights.to_vec();
    let mut capped = vec![false; n];

    for _ in 0..=n {
        let mut excess = 0.0;
        for i in 0..n {
            if !capped[i] && w[i] > cap {
                excess += w[i] - cap;
                w[i] = cap;
                capped[i] = true;
            }
        }
        if excess <= DEGENERATE_EPS {
            break;
        }

        let free: Vec<usize> = (0..n).filter(|&i| !capped[i]).collect();
        if free.is_empty() {
            break;
        }
        let free_mass: f64 = free.iter().map(|&i| w[i]).sum();
        if free_mass > DEGENERATE_EPS {
            for &i in &free {
                w[i] += excess * w[i] / free_mass;
            }
        } else {
            let share = excess / free.len() as f64;
            for &i in &free {
                w[i] += share;
            }
        }
    }

    w
}

/// `share * primary + (1 - share) * secondary`
pub fn blend(primary: &[f64], secondary: &[f64], share: f64) -> Vec<f64> {
    primary
        .iter()
        .zip(secondary)
        .map(|(p, s)| share * p + (1.0 - share) * s)
        .collect()
}
