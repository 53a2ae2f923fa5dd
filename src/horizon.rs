//! Theoretical reach estimation (spec §4.1).
//!
//! Precomputes `H[d][t] = Sum[d^k, 0 <= k < t]` for every `(degree, ttl)`
//! pair in range, then returns it damped by a fuzzy factor to model
//! per-hop flow-control loss. Pure function of its inputs; holds no state
//! once built.

use crate::config::DqConfig;
use crate::error::DqError;

/// Precomputed `degree x ttl` horizon table.
#[derive(Debug, Clone)]
pub struct HorizonTable {
    max_degree: u32,
    max_ttl: u8,
    fuzzy_factor: f64,
    // table[d-1][t-1] = H[d][t], unattenuated.
    table: Vec<Vec<u64>>,
}

impl HorizonTable {
    pub fn new(config: &DqConfig) -> Self {
        let max_degree = config.max_degree.max(1);
        let max_ttl = config.max_ttl.max(1);
        let mut table = vec![vec![0u64; max_ttl as usize]; max_degree as usize];

        for (d_idx, row) in table.iter_mut().enumerate() {
            let degree = (d_idx + 1) as u64;
            let mut sum = 0u64;
            let mut power = 1u64;
            for (t_idx, slot) in row.iter_mut().enumerate() {
                if t_idx == 0 {
                    sum = 1;
                } else {
                    power = power.saturating_mul(degree);
                    sum = sum.saturating_add(power);
                }
                *slot = sum;
            }
        }

        HorizonTable {
            max_degree,
            max_ttl,
            fuzzy_factor: config.fuzzy_factor,
            table,
        }
    }

    /// Estimated number of hosts reachable through a neighbor advertising
    /// `degree` at a given `ttl`, clamped to the table bounds and damped by
    /// `fuzzy_factor^(ttl-1)`.
    ///
    /// Returns an error if `degree == 0` or `ttl == 0`; every internal
    /// call site already guarantees positive inputs, so those use
    /// [`HorizonTable::horizon_unchecked`] plus a `debug_assert!` instead.
    pub fn horizon(&self, degree: u32, ttl: u8) -> Result<u32, DqError> {
        if degree == 0 {
            return Err(DqError::InvalidDegree(degree));
        }
        if ttl == 0 {
            return Err(DqError::InvalidTtl(ttl as u32));
        }
        Ok(self.horizon_unchecked(degree, ttl))
    }

    pub(crate) fn horizon_unchecked(&self, degree: u32, ttl: u8) -> u32 {
        debug_assert!(degree > 0 && ttl > 0);
        let d = degree.min(self.max_degree) as usize - 1;
        let t = ttl.min(self.max_ttl) as usize - 1;
        let raw = self.table[d][t] as f64;
        let damped = raw * self.fuzzy_factor.powi(t as i32);
        damped as u32
    }

    pub fn max_degree(&self) -> u32 {
        self.max_degree
    }

    pub fn max_ttl(&self) -> u8 {
        self.max_ttl
    }
}
