/// Property lookups for the working fluid of tanks and draw circuits.
///
/// Temperatures are in deg C, densities in kg/m3 and specific heats in J/(kg.K).
pub trait FluidProperties {
    fn density(&self, temperature: f64) -> f64;
    fn specific_heat(&self, temperature: f64) -> f64;
}

/// A fluid with fixed properties.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MaterialProperties {
    density: f64,
    specific_heat_capacity: f64,
}

impl MaterialProperties {
    pub const fn new(density: f64, specific_heat_capacity: f64) -> Self {
        Self {
            density,
            specific_heat_capacity,
        }
    }

    pub fn volumetric_heat_capacity(&self) -> f64 {
        self.density * self.specific_heat_capacity
    }
}

impl FluidProperties for MaterialProperties {
    fn density(&self, _temperature: f64) -> f64 {
        self.density
    }

    fn specific_heat(&self, _temperature: f64) -> f64 {
        self.specific_heat_capacity
    }
}

pub const WATER_CONSTANT: MaterialProperties = MaterialProperties::new(1000., 4180.);

/// Liquid water with a cubic density correlation valid from 0 to 100 deg C.
#[derive(Clone, Copy, Debug, Default)]
pub struct Water;

impl FluidProperties for Water {
    fn density(&self, temperature: f64) -> f64 {
        let t = temperature.clamp(0., 100.);
        1000.1207 + 8.3215874e-04 * t - 4.929976e-03 * t.powi(2) + 8.4791863e-06 * t.powi(3)
    }

    fn specific_heat(&self, _temperature: f64) -> f64 {
        4180.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::*;

    #[rstest]
    fn constant_properties_ignore_temperature() {
        assert_eq!(WATER_CONSTANT.density(5.), WATER_CONSTANT.density(80.));
        assert_relative_eq!(WATER_CONSTANT.volumetric_heat_capacity(), 4.18e6);
    }

    #[rstest]
    #[case(4., 999.97)]
    #[case(20., 998.2)]
    #[case(60., 983.2)]
    fn water_density_tracks_tabulated_values(#[case] temperature: f64, #[case] expected: f64) {
        assert_relative_eq!(Water.density(temperature), expected, max_relative = 2e-3);
    }
}
