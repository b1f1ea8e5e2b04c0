//! Rauch–Tung–Striebel backward pass.
//!
//! Reads filtered states and returns a separate smoothed sequence. The
//! filtered input is never modified. Unavailable minutes break the chain:
//! they are passed through unchanged and the pass restarts from the filtered
//! state just before them.

use crate::estimator::state_space::{
    from_mat, from_vec, psd_project, to_mat, to_vec, EstimateStatus, LatentState,
};
use crate::pipeline::clock::Nanos;
use nalgebra::Matrix2;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmoothedState {
    pub minute_ts: Nanos,
    pub status: EstimateStatus,
    pub mean: [f64; 2],
    pub covariance: [[f64; 2]; 2],
}

impl SmoothedState {
    fn from_filtered(s: &LatentState) -> Self {
        Self {
            minute_ts: s.minute_ts,
            status: s.status,
            mean: s.mean,
            covariance: s.covariance,
        }
    }

    pub fn efficient_price(&self) -> Option<f64> {
        (self.status != EstimateStatus::Unavailable).then(|| self.mean[0].exp())
    }
}

pub fn rts_smooth(filtered: &[LatentState], covariance_floor: f64) -> Vec<SmoothedState> {
    let mut out: Vec<SmoothedState> = filtered.iter().map(SmoothedState::from_filtered).collect();
    if filtered.len() < 2 {
        return out;
    }

    for t in (0..filtered.len() - 1).rev() {
        let cur = &filtered[t];
        let next = &filtered[t + 1];
        if !cur.is_available() || !next.is_available() {
            continue;
        }

        let f = Matrix2::new(1.0, 0.0, 0.0, next.phi);
        let p_pred = to_mat(&next.predicted_covariance);
        let p_pred_inv = match p_pred.try_inverse() {
            Some(inv) => inv,
            None => continue,
        };
        let p = to_mat(&cur.covariance);
        let gain = p * f.transpose() * p_pred_inv;

        let x_next_s = to_vec(&out[t + 1].mean);
        let p_next_s = to_mat(&out[t + 1].covariance);
        let x_s = to_vec(&cur.mean) + gain * (x_next_s - to_vec(&next.predicted_mean));
        let p_s = p + gain * (p_next_s - p_pred) * gain.transpose();
        let (p_s, _) = psd_project(p_s, covariance_floor, f64::MAX);

        if x_s.iter().all(|v| v.is_finite()) && p_s.iter().all(|v| v.is_finite()) {
            out[t].mean = from_vec(&x_s);
            out[t].covariance = from_mat(&p_s);
        }
    }
    out
}
