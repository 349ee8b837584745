use crate::{NasError, NasFloat};
use ndarray::{ArrayD, ArrayViewD, Zip};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    Relu,
    Relu6,
    HSwish,
    HSigmoid,
    Sigmoid,
}

fn relu6(x: NasFloat) -> NasFloat {
    x.max(0.).min(6.)
}

impl ActivationKind {
    pub fn apply(self, x: NasFloat) -> NasFloat {
        match self {
            Self::Relu => x.max(0.),
            Self::Relu6 => relu6(x),
            Self::HSwish => x * relu6(x + 3.) / 6.,
            Self::HSigmoid => relu6(x + 3.) / 6.,
            Self::Sigmoid => 1. / (1. + (-x).exp()),
        }
    }

    /// Derivative at `x`. Kinks take the right-hand derivative except at the upper
    /// clamp of relu6.
    pub fn derivative(self, x: NasFloat) -> NasFloat {
        match self {
            Self::Relu => {
                if x > 0. {
                    1.
                } else {
                    0.
                }
            }
            Self::Relu6 => {
                if x > 0. && x < 6. {
                    1.
                } else {
                    0.
                }
            }
            Self::HSwish => {
                if x <= -3. {
                    0.
                } else if x >= 3. {
                    1.
                } else {
                    (2. * x + 3.) / 6.
                }
            }
            Self::HSigmoid => {
                if x > -3. && x < 3. {
                    1. / 6.
                } else {
                    0.
                }
            }
            Self::Sigmoid => {
                let s = self.apply(x);
                s * (1. - s)
            }
        }
    }

    pub fn forward(self, input: ArrayViewD<NasFloat>) -> ArrayD<NasFloat> {
        input.mapv(|x| self.apply(x))
    }

    pub fn backward(
        self,
        input: ArrayViewD<NasFloat>,
        grad_output: ArrayViewD<NasFloat>,
    ) -> ArrayD<NasFloat> {
        let mut grad = grad_output.to_owned();
        Zip::from(&mut grad)
            .and(&input)
            .for_each(|g, &x| *g *= self.derivative(x));
        grad
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Relu => "relu",
            Self::Relu6 => "relu6",
            Self::HSwish => "h_swish",
            Self::HSigmoid => "h_sigmoid",
            Self::Sigmoid => "sigmoid",
        }
    }
}

impl fmt::Display for ActivationKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ActivationKind {
    type Err = NasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "relu" => Ok(Self::Relu),
            "relu6" => Ok(Self::Relu6),
            "h_swish" => Ok(Self::HSwish),
            "h_sigmoid" => Ok(Self::HSigmoid),
            "sigmoid" => Ok(Self::Sigmoid),
            other => Err(NasError::configuration(format!(
                "do not support activation {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    #[test]
    fn test_parse_activation() {
        assert_eq!("h_swish".parse::<ActivationKind>().unwrap(), ActivationKind::HSwish);
        assert!("tanh".parse::<ActivationKind>().is_err());
        assert_eq!(ActivationKind::Relu6.to_string(), "relu6");
    }

    proptest! {
        #[test]
        fn test_derivative_matches_finite_difference(x in -8.0f64..8.0) {
            let kinds = [
                ActivationKind::Relu,
                ActivationKind::Relu6,
                ActivationKind::HSwish,
                ActivationKind::HSigmoid,
                ActivationKind::Sigmoid,
            ];
            // Stay clear of the kinks
            prop_assume!([-3., 0., 3., 6.].iter().all(|k: &f64| (x - k).abs() > 1e-3));
            let h = 1e-6;
            for kind in kinds {
                let numeric = (kind.apply(x + h) - kind.apply(x - h)) / (2. * h);
                assert_abs_diff_eq!(numeric, kind.derivative(x), epsilon = 1e-5);
            }
        }
    }
}
