use serde::{Deserialize, Serialize};

/// Performance curves used as multipliers on rated capacity, COP, efficiency and part load.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type", deny_unknown_fields)]
pub enum Curve {
    Linear {
        coefficients: [f64; 2],
        #[serde(default)]
        limits: CurveLimits,
    },
    Quadratic {
        coefficients: [f64; 3],
        #[serde(default)]
        limits: CurveLimits,
    },
    Cubic {
        coefficients: [f64; 4],
        #[serde(default)]
        limits: CurveLimits,
    },
    /// `c0 + c1 x + c2 x^2 + c3 y + c4 y^2 + c5 x y`
    Biquadratic {
        coefficients: [f64; 6],
        #[serde(default)]
        limits: CurveLimits,
    },
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CurveLimits {
    pub min_x: Option<f64>,
    pub max_x: Option<f64>,
    pub min_y: Option<f64>,
    pub max_y: Option<f64>,
    pub min_output: Option<f64>,
    pub max_output: Option<f64>,
}

impl CurveLimits {
    fn clamp_input(value: f64, min: Option<f64>, max: Option<f64>) -> f64 {
        let value = min.map_or(value, |min| value.max(min));
        max.map_or(value, |max| value.min(max))
    }

    fn clamp_output(&self, value: f64) -> f64 {
        Self::clamp_input(value, self.min_output, self.max_output)
    }
}

impl Curve {
    /// Evaluate a curve of one independent variable. A biquadratic curve is evaluated with `y = 0`.
    pub fn value(&self, x: f64) -> f64 {
        self.value_2d(x, 0.)
    }

    pub fn value_2d(&self, x: f64, y: f64) -> f64 {
        let limits = self.limits();
        let x = CurveLimits::clamp_input(x, limits.min_x, limits.max_x);
        let raw = match self {
            Curve::Linear { coefficients: c, .. } => c[0] + c[1] * x,
            Curve::Quadratic { coefficients: c, .. } => c[0] + x * (c[1] + x * c[2]),
            Curve::Cubic { coefficients: c, .. } => c[0] + x * (c[1] + x * (c[2] + x * c[3])),
            Curve::Biquadratic { coefficients: c, .. } => {
                let y = CurveLimits::clamp_input(y, limits.min_y, limits.max_y);
                c[0] + c[1] * x + c[2] * x * x + c[3] * y + c[4] * y * y + c[5] * x * y
            }
        };
        limits.clamp_output(raw)
    }

    fn limits(&self) -> &CurveLimits {
        match self {
            Curve::Linear { limits, .. }
            | Curve::Quadratic { limits, .. }
            | Curve::Cubic { limits, .. }
            | Curve::Biquadratic { limits, .. } => limits,
        }
    }
}

/// Evaluate an optional multiplier curve, treating an absent curve as 1.
pub(crate) fn modifier(curve: Option<&Curve>, x: f64, y: f64) -> f64 {
    curve.map_or(1., |curve| curve.value_2d(x, y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use rstest::*;
    use serde_json::json;

    #[rstest]
    fn should_evaluate_quadratic_part_load_curve() {
        let curve = Curve::Quadratic {
            coefficients: [0.8, 0.2, 0.],
            limits: Default::default(),
        };
        assert_relative_eq!(curve.value(0.5), 0.9);
    }

    #[rstest]
    fn should_clamp_inputs_and_output() {
        let curve = Curve::Linear {
            coefficients: [0., 2.],
            limits: CurveLimits {
                max_x: Some(1.),
                max_output: Some(1.5),
                ..Default::default()
            },
        };
        assert_eq!(curve.value(3.), 1.5);
        assert_eq!(curve.value(0.25), 0.5);
    }

    #[rstest]
    fn should_evaluate_biquadratic_from_json() {
        let curve: Curve = serde_json::from_value(json!({
            "type": "Biquadratic",
            "coefficients": [1.0, 0.01, 0.0, -0.02, 0.0, 0.001]
        }))
        .unwrap();
        assert_relative_eq!(curve.value_2d(20., 50.), 1. + 0.2 - 1. + 1.);
    }

    #[rstest]
    fn absent_curve_is_unity() {
        assert_eq!(modifier(None, 12., 34.), 1.);
    }
}
