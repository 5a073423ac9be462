//! Value/derivative pairs for the hidden-layer nonlinearities.

use cartpole_protocol::Activation;

const ELU_ALPHA: f64 = 1.0;

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

pub fn apply(act: Activation, x: f64) -> f64 {
    match act {
        Activation::Relu => x.max(0.0),
        Activation::Tanh => x.tanh(),
        Activation::Elu => {
            if x > 0.0 {
                x
            } else {
                ELU_ALPHA * (x.exp() - 1.0)
            }
        }
        Activation::Swish => x * sigmoid(x),
    }
}

/// Derivative with respect to the pre-activation `x`.
pub fn derivative(act: Activation, x: f64) -> f64 {
    match act {
        Activation::Relu => {
            if x > 0.0 {
                1.0
            } else {
                0.0
            }
        }
        Activation::Tanh => {
            let t = x.tanh();
            1.0 - t * t
        }
        Activation::Elu => {
            if x > 0.0 {
                1.0
            } else {
                ELU_ALPHA * x.exp()
            }
        }
        Activation::Swish => {
            let s = sigmoid(x);
            s + x * s * (1.0 - s)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Activation; 4] = [Activation::Relu, Activation::Tanh, Activation::Elu, Activation::Swish];

    #[test]
    fn test_derivative_matches_finite_difference() {
        let h = 1e-6;
        for act in ALL {
            // Skip 0.0: ReLU and ELU kinks.
            for &x in &[-2.0, -0.3, 0.4, 1.7] {
                let numeric = (apply(act, x + h) - apply(act, x - h)) / (2.0 * h);
                let analytic = derivative(act, x);
                assert!(
                    (numeric - analytic).abs() < 1e-5,
                    "{act}: d/dx at {x} numeric={numeric} analytic={analytic}"
                );
            }
        }
    }

    #[test]
    fn test_known_values() {
        assert_eq!(apply(Activation::Relu, -3.0), 0.0);
        assert_eq!(apply(Activation::Swish, 0.0), 0.0);
        assert!((apply(Activation::Elu, -50.0) + 1.0).abs() < 1e-12);
        assert_eq!(derivative(Activation::Swish, 0.0), 0.5);
    }
}
