//! Adam, one instance per parameter tensor.

use super::network::ActorCritic;
use super::tensor::Matrix;

pub const BETA1: f64 = 0.9;
pub const BETA2: f64 = 0.999;
pub const EPSILON: f64 = 1e-8;

#[derive(Debug, Clone)]
pub struct Adam {
    pub lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    m: Matrix,
    v: Matrix,
    t: u32,
}

impl Adam {
    pub fn new(rows: usize, cols: usize, lr: f64) -> Self {
        Adam {
            lr,
            beta1: BETA1,
            beta2: BETA2,
            eps: EPSILON,
            m: Matrix::zeros(rows, cols),
            v: Matrix::zeros(rows, cols),
            t: 0,
        }
    }

    /// Optimizer shaped for `param`.
    pub fn for_param(param: &Matrix, lr: f64) -> Self {
        Self::new(param.rows(), param.cols(), lr)
    }

    pub fn steps(&self) -> u32 {
        self.t
    }

    /// One Adam step, in place. Panics if `param`, `grad` and the moment
    /// buffers do not all share one shape.
    pub fn update(&mut self, param: &mut Matrix, grad: &Matrix) {
        assert_eq!(param.shape(), grad.shape(), "parameter/gradient shape mismatch");
        assert_eq!(param.shape(), self.m.shape(), "optimizer was built for a different shape");

        self.t += 1;
        let bias_correction1 = 1.0 - self.beta1.powi(self.t as i32);
        let bias_correction2 = 1.0 - self.beta2.powi(self.t as i32);

        let m = self.m.as_mut_slice();
        let v = self.v.as_mut_slice();
        for (i, (p, &g)) in param.as_mut_slice().iter_mut().zip(grad.as_slice()).enumerate() {
            m[i] = self.beta1 * m[i] + (1.0 - self.beta1) * g;
            v[i] = self.beta2 * v[i] + (1.0 - self.beta2) * g * g;
            let m_hat = m[i] / bias_correction1;
            let v_hat = v[i] / bias_correction2;
            *p -= self.lr * m_hat / (v_hat.sqrt() + self.eps);
        }
    }
}

/// One optimizer per network tensor, in [`ActorCritic::parameters`] order.
#[derive(Debug, Clone)]
pub struct OptimizerSet {
    slots: Vec<Adam>,
}

impl OptimizerSet {
    pub fn for_network(net: &ActorCritic, lr: f64) -> Self {
        OptimizerSet { slots: net.parameters().map(|p| Adam::for_param(p, lr)).collect() }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        for opt in &mut self.slots {
            opt.lr = lr;
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.slots.first().map_or(0.0, |o| o.lr)
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Adam> {
        self.slots.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_step_is_lr_sized() {
        // With bias correction m̂ = g and v̂ = g² on the first step.
        let mut adam = Adam::new(1, 3, 0.01);
        let mut p = Matrix::from_vec(1, 3, vec![1.0, 1.0, 1.0]);
        let g = Matrix::from_vec(1, 3, vec![0.5, -2.0, 0.0]);
        adam.update(&mut p, &g);
        assert!((p[(0, 0)] - 0.99).abs() < 1e-9);
        assert!((p[(0, 1)] - 1.01).abs() < 1e-9);
        assert_eq!(p[(0, 2)], 1.0);
        assert_eq!(adam.steps(), 1);
    }

    #[test]
    fn test_constant_gradient_moves_monotonically() {
        let lr = 0.001;
        let mut adam = Adam::new(2, 2, lr);
        let mut p = Matrix::zeros(2, 2);
        let g = Matrix::from_vec(2, 2, vec![0.3, 0.3, -4.0, 1e-3]);
        let mut prev = p.clone();
        for _ in 0..2000 {
            adam.update(&mut p, &g);
            for i in 0..4 {
                let (before, after, grad) = (prev.as_slice()[i], p.as_slice()[i], g.as_slice()[i]);
                assert!((after - before) * grad.signum() < 0.0, "moved with the gradient");
                let step = (after - before).abs();
                let expected = lr * grad.abs() / (grad.abs() + EPSILON);
                assert!((step - expected).abs() < 1e-9, "step {step} vs {expected}");
            }
            prev = p.clone();
        }
        // Effective step approaches lr / (1 + ε).
        assert!((p[(0, 0)] + 2000.0 * lr).abs() < 1e-6);
    }

    #[test]
    #[should_panic(expected = "shape mismatch")]
    fn test_shape_mismatch_is_fatal() {
        let mut adam = Adam::new(2, 2, 0.1);
        let mut p = Matrix::zeros(2, 2);
        adam.update(&mut p, &Matrix::zeros(1, 4));
    }

    #[test]
    #[should_panic(expected = "different shape")]
    fn test_foreign_optimizer_is_fatal() {
        let mut adam = Adam::new(1, 4, 0.1);
        let mut p = Matrix::zeros(2, 2);
        adam.update(&mut p, &Matrix::zeros(2, 2));
    }
}
