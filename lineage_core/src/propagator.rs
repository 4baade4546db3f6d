//! Closed-form propagation of the latent process between observations.
//!
//! The latent state is z = (x, g, λ, q): log-length, FP amount,
//! elongation rate and production rate. Between observations it evolves
//! by the linear-in-(λ,q) SDE
//!
//! ```text
//! dλ = -γ_λ (λ - mean_λ) dt + σ_λ dW_λ
//! dq = -γ_q (q - mean_q) dt + σ_q dW_q
//! dx = λ dt
//! dg = (q e^x - β g) dt
//! ```
//!
//! Given a Gaussian belief N(μ, Σ) at time 0, [`propagate`] returns the
//! first two moments of z at time Δt in closed form. The (x, λ, q)
//! sub-block is the standard OU update; every entry touching g reduces
//! to the Gaussian-weighted moment integrals of [`crate::special`],
//! since E[q e^x] over a Gaussian is an exponential-quadratic integral.
//!
//! The g-entries require γ_q > 0 and Σ_λλ > 0 (the integrals' `a > 0`
//! domain); outside that region the result is non-finite and the caller
//! forwards it to the optimiser untouched. The pure OU factors use a
//! series branch at small γ·Δt so that γ → 0 reaches the analytic limit.

use nalgebra::{Matrix4, Vector4};

use crate::params::Theta;
use crate::special::{int0, int1, int2, int3};

/// `(1 - exp(-γ t)) / γ`, continuous at γ = 0.
fn ou_decay(gamma: f64, t: f64) -> f64 {
    let u = gamma * t;
    if u.abs() < 1e-8 {
        t * (1.0 - u / 2.0 + u * u / 6.0)
    } else {
        (1.0 - (-u).exp()) / gamma
    }
}

/// Variance kernel of integrated OU noise:
/// `(2γt - 3 + 4 e^{-γt} - e^{-2γt}) / (2γ³)`, continuous at γ = 0.
fn integrated_ou_kernel(gamma: f64, t: f64) -> f64 {
    let u = gamma * t;
    if u.abs() < 1e-4 {
        t * t * t * (1.0 / 3.0 - u / 4.0 + 7.0 * u * u / 60.0 - u * u * u / 24.0)
    } else {
        (2.0 * u - 3.0 + 4.0 * (-u).exp() - (-2.0 * u).exp()) / (2.0 * gamma.powi(3))
    }
}

/// Propagates a Gaussian belief over the latent state by `dt > 0`.
///
/// Inputs are unmodified. The output covariance is symmetric by
/// construction; it is a valid covariance only as far as the closed
/// forms stay inside finite arithmetic — no eigenvalue repair happens
/// here.
pub fn propagate(mean: &Vector4<f64>, cov: &Matrix4<f64>, dt: f64, th: &Theta) -> (Vector4<f64>, Matrix4<f64>) {
    let t = dt;

    let bx = mean[0];
    let bg = mean[1];
    let bl = mean[2];
    let bq = mean[3];

    let cxx = cov[(0, 0)];
    let cxg = cov[(0, 1)];
    let cxl = cov[(0, 2)];
    let cxq = cov[(0, 3)];
    let cgg = cov[(1, 1)];
    let cgl = cov[(1, 2)];
    let cgq = cov[(1, 3)];
    let cll = cov[(2, 2)];
    let clq = cov[(2, 3)];
    let cqq = cov[(3, 3)];

    let ml = th.mean_lambda;
    let gl = th.gamma_lambda;
    let sl2 = th.var_lambda;
    let mq = th.mean_q;
    let gq = th.gamma_q;
    let sq2 = th.var_q;
    let b = th.beta;

    let a = cll / 2.0;
    let egl = (-gl * t).exp();
    let egq = (-gq * t).exp();
    let d = ou_decay(gl, t);

    // ------------------------------------------------------------------
    // Means
    // ------------------------------------------------------------------

    let nm0 = bx + ml * t + (bl - ml) * d;

    let nm1 = bg * (-b * t).exp()
        + clq * int1(a, b + bl + cxl - gq, bx + cxx / 2.0 - b * t, t, 0.0)
        + mq * int0(a, b + bl + cxl, bx + cxx / 2.0 - b * t, t, 0.0)
        + (bq + cxq - mq) * int0(a, b + bl + cxl - gq, bx + cxx / 2.0 - b * t, t, 0.0);

    let nm2 = ml + (bl - ml) * egl;
    let nm3 = mq + (bq - mq) * egq;

    // ------------------------------------------------------------------
    // Covariance, (x, λ, q) sub-block: standard OU update
    // ------------------------------------------------------------------

    let ncxx = cll * d * d + 2.0 * cxl * d + cxx + sl2 * integrated_ou_kernel(gl, t);
    let ncxl = sl2 * d * d / 2.0 + cll * egl * d + cxl * egl;
    let ncxq = clq * d * egq + cxq * egq;
    let ncll = cll * egl * egl + sl2 * ou_decay(2.0 * gl, t);
    let nclq = clq * egl * egq;
    let ncqq = sq2 * ou_decay(2.0 * gq, t) + cqq * egq * egq;

    // ------------------------------------------------------------------
    // Covariance entries involving g: raw second moments via I_k,
    // centred by the new means at the end of each expression.
    // ------------------------------------------------------------------

    let ncxg = (bg * bx) / (b * t).exp()
        + cxg / (b * t).exp()
        + (bg * bl) / ((b * t).exp() * gl)
        + cgl / ((b * t).exp() * gl)
        - (bg * bl) / (((b + gl) * t).exp() * gl)
        - cgl / (((b + gl) * t).exp() * gl)
        - (bg * ml) / ((b * t).exp() * gl)
        + (bg * ml) / (((b + gl) * t).exp() * gl)
        + (bg * ml * t) / (b * t).exp()
        + (cxl * mq + (cll * mq) / gl) * int1(a, b + bl + cxl, bx + cxx / 2.0 - b * t, t, 0.0)
        - (cll * mq * int1(a, b + bl + cxl, bx + cxx / 2.0 - b * t - gl * t, t, 0.0)) / gl
        + (bx * clq + bq * cxl + cxl * cxq + clq * cxx
            + (bq * cll) / gl
            + (bl * clq) / gl
            + (clq * cxl) / gl
            + (cll * cxq) / gl
            - (clq * ml) / gl
            - cxl * mq
            - (cll * mq) / gl
            + clq * ml * t)
            * int1(a, b + bl + cxl - gq, bx + cxx / 2.0 - b * t, t, 0.0)
        + (-((bq * cll) / gl) - (bl * clq) / gl - (clq * cxl) / gl - (cll * cxq) / gl
            + (clq * ml) / gl
            + (cll * mq) / gl)
            * int1(a, b + bl + cxl - gq, bx + cxx / 2.0 - b * t - gl * t, t, 0.0)
        + (clq * cxl + (cll * clq) / gl) * int2(a, b + bl + cxl - gq, bx + cxx / 2.0 - b * t, t, 0.0)
        - (cll * clq * int2(a, b + bl + cxl - gq, bx + cxx / 2.0 - b * t - gl * t, t, 0.0)) / gl
        + (bx * mq + cxx * mq + (bl * mq) / gl + (cxl * mq) / gl - (ml * mq) / gl + ml * mq * t)
            * int0(a, b + bl + cxl, bx + cxx / 2.0 - b * t, t, 0.0)
        + (-((bl * mq) / gl) - (cxl * mq) / gl + (ml * mq) / gl)
            * int0(a, b + bl + cxl, bx + cxx / 2.0 - b * t - gl * t, t, 0.0)
        + (bq * bx + cxq + bx * cxq + bq * cxx + cxq * cxx
            + (bl * bq) / gl
            + clq / gl
            + (bq * cxl) / gl
            + (bl * cxq) / gl
            + (cxl * cxq) / gl
            - (bq * ml) / gl
            - (cxq * ml) / gl
            - bx * mq
            - cxx * mq
            - (bl * mq) / gl
            - (cxl * mq) / gl
            + (ml * mq) / gl
            + bq * ml * t
            + cxq * ml * t
            - ml * mq * t)
            * int0(a, b + bl + cxl - gq, bx + cxx / 2.0 - b * t, t, 0.0)
        + (-((bl * bq) / gl) - clq / gl - (bq * cxl) / gl - (bl * cxq) / gl - (cxl * cxq) / gl
            + (bq * ml) / gl
            + (cxq * ml) / gl
            + (bl * mq) / gl
            + (cxl * mq) / gl
            - (ml * mq) / gl)
            * int0(a, b + bl + cxl - gq, bx + cxx / 2.0 - b * t - gl * t, t, 0.0)
        - nm1 * nm0;

    let ncgl = (bg * bl) / ((b + gl) * t).exp()
        + cgl / ((b + gl) * t).exp()
        + (bg * ml) / (b * t).exp()
        - (bg * ml) / ((b + gl) * t).exp()
        + cll * mq * int1(a, b + bl + cxl, bx + cxx / 2.0 - b * t - gl * t, t, 0.0)
        + clq * ml * int1(a, b + bl + cxl - gq, bx + cxx / 2.0 - b * t, t, 0.0)
        + (bq * cll + bl * clq + clq * cxl + cll * cxq - clq * ml - cll * mq)
            * int1(a, b + bl + cxl - gq, bx + cxx / 2.0 - b * t - gl * t, t, 0.0)
        + cll * clq * int2(a, b + bl + cxl - gq, bx + cxx / 2.0 - b * t - gl * t, t, 0.0)
        + ml * mq * int0(a, b + bl + cxl, bx + cxx / 2.0 - b * t, t, 0.0)
        + (bl * mq + cxl * mq - ml * mq)
            * int0(a, b + bl + cxl, bx + cxx / 2.0 - b * t - gl * t, t, 0.0)
        + (bq * ml + cxq * ml - ml * mq)
            * int0(a, b + bl + cxl - gq, bx + cxx / 2.0 - b * t, t, 0.0)
        + (bl * bq + clq + bq * cxl + bl * cxq + cxl * cxq - bq * ml - cxq * ml - bl * mq
            - cxl * mq
            + ml * mq)
            * int0(a, b + bl + cxl - gq, bx + cxx / 2.0 - b * t - gl * t, t, 0.0)
        - nm1 * nm2;

    let ncgq = (bg * bq) / ((b + gq) * t).exp()
        + cgq / ((b + gq) * t).exp()
        + (bg * mq) / (b * t).exp()
        - (bg * mq) / ((b + gq) * t).exp()
        + clq * mq * int1(a, b + bl + cxl, bx + cxx / 2.0 - b * t - gq * t, t, 0.0)
        + clq * mq * int1(a, b + bl + cxl - gq, bx + cxx / 2.0 - b * t, t, 0.0)
        + (2.0 * bq * clq + 2.0 * clq * cxq - 2.0 * clq * mq)
            * int1(a, b + bl + cxl - gq, bx + cxx / 2.0 - b * t - gq * t, t, 0.0)
        + clq * clq * int2(a, b + bl + cxl - gq, bx + cxx / 2.0 - b * t - gq * t, t, 0.0)
        + mq * mq * int0(a, b + bl + cxl, bx + cxx / 2.0 - b * t, t, 0.0)
        + (bq * mq + cxq * mq - mq * mq)
            * int0(a, b + bl + cxl, bx + cxx / 2.0 - b * t - gq * t, t, 0.0)
        + (bq * mq + cxq * mq - mq * mq)
            * int0(a, b + bl + cxl - gq, bx + cxx / 2.0 - b * t, t, 0.0)
        - (sq2 * int0(a, b + bl + cxl - gq, -b * t + bx + cxx / 2.0 - gq * t, t, 0.0)) / (2.0 * gq)
        + (bq * bq + cqq + 2.0 * bq * cxq + cxq * cxq - 2.0 * bq * mq - 2.0 * cxq * mq + mq * mq)
            * int0(a, b + bl + cxl - gq, bx + cxx / 2.0 - b * t - gq * t, t, 0.0)
        + (sq2 * int0(a, b + bl + cxl + gq, -b * t + bx + cxx / 2.0 - gq * t, t, 0.0)) / (2.0 * gq)
        - nm1 * nm3;

    let ncgg = (bg * bg + cgg) / (2.0 * b * t).exp()
        + 2.0 * cgl * mq * int1(a, b + bl + cxl, bx + cxx / 2.0 - 2.0 * b * t, t, 0.0)
        + (mq * (2.0 * clq + gq * mq)
            * int1(a, b + bl + 2.0 * cxl, 2.0 * (bx + cxx - b * t), t, 0.0))
            / gq
        + 2.0 * (bq * cgl + bg * clq + clq * cxg + cgl * cxq - cgl * mq)
            * int1(a, b + bl + cxl - gq, bx + cxx / 2.0 - 2.0 * b * t, t, 0.0)
        + ((bq * bq * gq + cqq * gq + 4.0 * bq * cxq * gq + 4.0 * cxq * cxq * gq
            - 2.0 * clq * mq
            - 2.0 * bq * gq * mq
            - 4.0 * cxq * gq * mq
            + gq * mq * mq)
            * int1(a, b + bl + 2.0 * cxl - gq, 2.0 * (bx + cxx - b * t), t, 0.0))
            / gq
        - mq * mq * int1(a, b + bl + 2.0 * cxl, 2.0 * (bx + cxx - b * t), 2.0 * t, t)
        - (2.0 * clq * mq
            * int1(a, b + bl + 2.0 * cxl, 2.0 * bx + 2.0 * cxx - (2.0 * b + gq) * t, 2.0 * t, t))
            / gq
        - (sq2 * int1(a, b + bl + 2.0 * cxl - gq, 2.0 * bx + 2.0 * cxx - 2.0 * b * t, t, 0.0))
            / (2.0 * gq)
        + (sq2 * int1(a, b + bl + 2.0 * cxl - gq, 2.0 * bx + 2.0 * cxx - 2.0 * b * t, 2.0 * t, t))
            / (2.0 * gq)
        + (-(bq * bq) - cqq - 4.0 * bq * cxq - 4.0 * cxq * cxq
            + 2.0 * bq * mq
            + 4.0 * cxq * mq
            - mq * mq
            + 4.0 * bq * clq * t
            + 8.0 * clq * cxq * t
            - 4.0 * clq * mq * t)
            * int1(a, b + bl + 2.0 * cxl - gq, 2.0 * (bx + cxx - b * t), 2.0 * t, t)
        + (2.0 * clq * mq
            * int1(a, b + bl + 2.0 * cxl - gq, 2.0 * bx + 2.0 * cxx - 2.0 * b * t + gq * t, 2.0 * t, t))
            / gq
        + clq * clq * int3(a, b + bl + 2.0 * cxl - gq, 2.0 * (bx + cxx - b * t), t, 0.0)
        - clq * clq * int3(a, b + bl + 2.0 * cxl - gq, 2.0 * (bx + cxx - b * t), 2.0 * t, t)
        + 2.0 * cgl * clq * int2(a, b + bl + cxl - gq, bx + cxx / 2.0 - 2.0 * b * t, t, 0.0)
        + (2.0 * bq * clq + 4.0 * clq * cxq - 2.0 * clq * mq)
            * int2(a, b + bl + 2.0 * cxl - gq, 2.0 * (bx + cxx - b * t), t, 0.0)
        + (-2.0 * bq * clq - 4.0 * clq * cxq + 2.0 * clq * mq + 2.0 * clq * clq * t)
            * int2(a, b + bl + 2.0 * cxl - gq, 2.0 * (bx + cxx - b * t), 2.0 * t, t)
        + (2.0 * bg * mq + 2.0 * cxg * mq) * int0(a, b + bl + cxl, bx + cxx / 2.0 - 2.0 * b * t, t, 0.0)
        + ((2.0 * bq * mq) / gq + (4.0 * cxq * mq) / gq - (2.0 * mq * mq) / gq)
            * int0(a, b + bl + 2.0 * cxl, 2.0 * (bx + cxx - b * t), t, 0.0)
        + (2.0 * bg * bq + 2.0 * cgq + 2.0 * bq * cxg + 2.0 * bg * cxq + 2.0 * cxg * cxq
            - 2.0 * bg * mq
            - 2.0 * cxg * mq)
            * int0(a, b + bl + cxl - gq, bx + cxx / 2.0 - 2.0 * b * t, t, 0.0)
        + (-((2.0 * bq * mq) / gq) - (4.0 * cxq * mq) / gq + (2.0 * mq * mq) / gq)
            * int0(a, b + bl + 2.0 * cxl - gq, 2.0 * (bx + cxx - b * t), t, 0.0)
        + (sq2 * int0(a, b + bl + 2.0 * cxl, 2.0 * bx + 2.0 * cxx - 2.0 * b * t, t, 0.0))
            / (2.0 * gq * gq)
        + (sq2 * int0(a, b + bl + 2.0 * cxl, 2.0 * bx + 2.0 * cxx - 2.0 * b * t, 2.0 * t, t))
            / (2.0 * gq * gq)
        + 2.0 * mq * mq * t * int0(a, b + bl + 2.0 * cxl, 2.0 * (bx + cxx - b * t), 2.0 * t, t)
        + (-((2.0 * bq * mq) / gq) - (4.0 * cxq * mq) / gq + (2.0 * mq * mq) / gq)
            * int0(a, b + bl + 2.0 * cxl, 2.0 * bx + 2.0 * cxx - (2.0 * b + gq) * t, 2.0 * t, t)
        - (sq2 * int0(a, b + bl + 2.0 * cxl - gq, 2.0 * bx + 2.0 * cxx - 2.0 * b * t, t, 0.0))
            / (2.0 * gq * gq)
        - (sq2
            * t
            * int0(a, b + bl + 2.0 * cxl - gq, 2.0 * bx + 2.0 * cxx - 2.0 * b * t, 2.0 * t, t))
            / gq
        + (2.0 * bq * bq * t + 2.0 * cqq * t + 8.0 * bq * cxq * t + 8.0 * cxq * cxq * t
            - 4.0 * bq * mq * t
            - 8.0 * cxq * mq * t
            + 2.0 * mq * mq * t)
            * int0(a, b + bl + 2.0 * cxl - gq, 2.0 * (bx + cxx - b * t), 2.0 * t, t)
        + ((2.0 * bq * mq) / gq + (4.0 * cxq * mq) / gq - (2.0 * mq * mq) / gq)
            * int0(a, b + bl + 2.0 * cxl - gq, 2.0 * bx + 2.0 * cxx - 2.0 * b * t + gq * t, 2.0 * t, t)
        - (sq2
            * int0(
                a,
                b + bl + 2.0 * cxl + gq,
                2.0 * bx + 2.0 * cxx - 2.0 * b * t - 2.0 * gq * t,
                2.0 * t,
                t,
            ))
            / (2.0 * gq * gq)
        - nm1 * nm1;

    let new_mean = Vector4::new(nm0, nm1, nm2, nm3);
    let new_cov = Matrix4::new(
        ncxx, ncxg, ncxl, ncxq, //
        ncxg, ncgg, ncgl, ncgq, //
        ncxl, ncgl, ncll, nclq, //
        ncxq, ncgq, nclq, ncqq,
    );
    (new_mean, new_cov)
}
