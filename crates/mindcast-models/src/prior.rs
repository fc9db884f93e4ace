//! Denoising diffusion prior over embedding space.
//!
//! Maps a conditioning embedding (the backbone's output) toward the target
//! CLIP embedding distribution. Training draws a random timestep per sample,
//! noises the target along a cosine schedule, and regresses the injected
//! noise; the denoised estimate is returned alongside the loss so the caller
//! can track reconstruction cosine similarity.

use burn::nn::loss::{MseLoss, Reduction};
use burn::nn::{Gelu, Linear, LinearConfig};
use burn::prelude::*;
use mindcast_core::RngKey;
use rand::Rng;
use rand_distr::StandardNormal;

const COSINE_SCHEDULE_OFFSET: f64 = 0.008;

#[derive(Config, Debug)]
pub struct NoisePriorConfig {
    /// Width of the target embedding space.
    pub embed_dim: usize,
    /// Width of the conditioning embedding.
    pub cond_dim: usize,
    #[config(default = 256)]
    pub hidden_dim: usize,
    #[config(default = 100)]
    pub timesteps: usize,
    /// Probability of dropping the conditioning for a sample
    /// (classifier-free guidance style).
    #[config(default = 0.2)]
    pub cond_drop_prob: f64,
}

impl NoisePriorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> NoisePrior<B> {
        NoisePrior {
            x_proj: LinearConfig::new(self.embed_dim, self.hidden_dim).init(device),
            cond_proj: LinearConfig::new(self.cond_dim, self.hidden_dim).init(device),
            time_proj: LinearConfig::new(1, self.hidden_dim).init(device),
            mid: LinearConfig::new(self.hidden_dim, self.hidden_dim).init(device),
            out: LinearConfig::new(self.hidden_dim, self.embed_dim).init(device),
            activation: Gelu::new(),
            timesteps: self.timesteps,
            cond_drop_prob: self.cond_drop_prob,
        }
    }
}

#[derive(Module, Debug)]
pub struct NoisePrior<B: Backend> {
    x_proj: Linear<B>,
    cond_proj: Linear<B>,
    time_proj: Linear<B>,
    mid: Linear<B>,
    out: Linear<B>,
    activation: Gelu,
    timesteps: usize,
    cond_drop_prob: f64,
}

/// Cumulative signal fraction of the cosine noise schedule at step `t`.
fn alpha_bar(t: usize, timesteps: usize) -> f64 {
    let f = |x: f64| {
        (((x + COSINE_SCHEDULE_OFFSET) / (1.0 + COSINE_SCHEDULE_OFFSET))
            * std::f64::consts::FRAC_PI_2)
            .cos()
            .powi(2)
    };
    let frac = t as f64 / timesteps as f64;
    (f(frac) / f(0.0)).clamp(1e-4, 0.9999)
}

impl<B: Backend> NoisePrior<B> {
    /// Denoising loss for one batch.
    ///
    /// Returns the scalar loss and the denoised target estimate (used as a
    /// side metric only).
    pub fn loss(
        &self,
        cond: Tensor<B, 2>,
        target: Tensor<B, 2>,
        key: RngKey,
    ) -> (Tensor<B, 1>, Tensor<B, 2>) {
        let [n, d] = target.dims();
        let device = target.device();
        let mut rng = key.to_rng();

        let mut sqrt_ab = Vec::with_capacity(n);
        let mut sqrt_1mab = Vec::with_capacity(n);
        let mut t_frac = Vec::with_capacity(n);
        let mut keep_cond = Vec::with_capacity(n);
        for _ in 0..n {
            let t = rng.gen_range(0..self.timesteps);
            let ab = alpha_bar(t, self.timesteps);
            sqrt_ab.push(ab.sqrt() as f32);
            sqrt_1mab.push((1.0 - ab).sqrt() as f32);
            t_frac.push((t as f32 + 0.5) / self.timesteps as f32);
            keep_cond.push(if rng.gen::<f64>() < self.cond_drop_prob {
                0.0f32
            } else {
                1.0
            });
        }
        let mut noise = Vec::with_capacity(n * d);
        for _ in 0..n * d {
            let z: f32 = rng.sample(StandardNormal);
            noise.push(z);
        }

        let col = |vals: &[f32]| -> Tensor<B, 2> {
            Tensor::<B, 1>::from_data(vals, &device).reshape([n, 1])
        };
        let sqrt_ab = col(&sqrt_ab);
        let sqrt_1mab = col(&sqrt_1mab);
        let keep_cond = col(&keep_cond);
        let t_col = col(&t_frac);
        let noise =
            Tensor::<B, 1>::from_data(noise.as_slice(), &device).reshape([n, d]);

        let x_t = target * sqrt_ab.clone() + noise.clone() * sqrt_1mab.clone();

        let h = self.x_proj.forward(x_t.clone())
            + self.cond_proj.forward(cond * keep_cond)
            + self.time_proj.forward(t_col);
        let h = self.activation.forward(h);
        let h = h.clone() + self.activation.forward(self.mid.forward(h));
        let pred_noise = self.out.forward(h);

        let loss = MseLoss::new().forward(pred_noise.clone(), noise, Reduction::Mean);
        let denoised = (x_t - pred_noise * sqrt_1mab) / sqrt_ab;
        (loss, denoised)
    }

    pub fn timesteps(&self) -> usize {
        self.timesteps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mindcast_core::NdBackend;

    #[test]
    fn test_alpha_bar_monotone_decreasing() {
        let timesteps = 100;
        let mut prev = alpha_bar(0, timesteps);
        assert!(prev > 0.99);
        for t in 1..timesteps {
            let cur = alpha_bar(t, timesteps);
            assert!(cur <= prev, "alpha_bar must decrease");
            prev = cur;
        }
        assert!(prev < 0.01);
    }

    #[test]
    fn test_loss_shapes_and_finiteness() {
        let device = Default::default();
        let prior = NoisePriorConfig::new(6, 4)
            .with_hidden_dim(16)
            .with_timesteps(10)
            .init::<NdBackend>(&device);

        let cond = Tensor::<NdBackend, 2>::ones([3, 4], &device);
        let target = Tensor::<NdBackend, 2>::ones([3, 6], &device);
        let (loss, denoised) = prior.loss(cond, target, RngKey::new(0));

        assert_eq!(denoised.dims(), [3, 6]);
        let loss_val: f32 = loss.into_data().to_vec::<f32>().unwrap()[0];
        assert!(loss_val.is_finite());
    }

    #[test]
    fn test_loss_deterministic_in_key() {
        let device = Default::default();
        let prior = NoisePriorConfig::new(4, 4)
            .with_hidden_dim(8)
            .with_timesteps(10)
            .init::<NdBackend>(&device);

        let cond = Tensor::<NdBackend, 2>::ones([2, 4], &device);
        let target = Tensor::<NdBackend, 2>::ones([2, 4], &device);
        let (loss_a, _) = prior.loss(cond.clone(), target.clone(), RngKey::new(9));
        let (loss_b, _) = prior.loss(cond, target, RngKey::new(9));

        let a: f32 = loss_a.into_data().to_vec::<f32>().unwrap()[0];
        let b: f32 = loss_b.into_data().to_vec::<f32>().unwrap()[0];
        assert_eq!(a, b);
    }
}
