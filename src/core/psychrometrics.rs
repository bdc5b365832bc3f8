//! Moist-air property functions used for the zone gains of water-use fixtures.
//!
//! Temperatures in deg C, pressures in Pa, humidity ratios in kg water / kg dry air.

use crate::core::units::KELVIN_OFFSET;

const GAS_CONSTANT_DRY_AIR: f64 = 287.042;
const MOLAR_MASS_RATIO: f64 = 0.621945;

/// Saturation vapour pressure over liquid water (Magnus form, Alduchov & Eskridge coefficients)
pub fn saturation_pressure(temperature: f64) -> f64 {
    610.94 * (17.625 * temperature / (temperature + 243.04)).exp()
}

pub fn humidity_ratio_at_saturation(temperature: f64, pressure: f64) -> f64 {
    let p_sat = saturation_pressure(temperature);
    if p_sat >= pressure {
        // boiling at this pressure; report the largest physically meaningful value
        return f64::MAX;
    }
    MOLAR_MASS_RATIO * p_sat / (pressure - p_sat)
}

/// Density of the dry-air portion of moist air, in kg/m3
pub fn dry_air_density(pressure: f64, temperature: f64, humidity_ratio: f64) -> f64 {
    pressure
        / (GAS_CONSTANT_DRY_AIR
            * (temperature + KELVIN_OFFSET)
            * (1. + humidity_ratio / MOLAR_MASS_RATIO))
}

/// Heat of vaporisation of water at the given temperature, in J/kg
pub fn latent_heat_of_vaporisation(temperature: f64) -> f64 {
    (2_500_940. + 1_858.95 * temperature) - 4_180. * temperature
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::units::STANDARD_PRESSURE;
    use approx::assert_relative_eq;
    use rstest::*;

    #[rstest]
    fn should_give_saturation_pressure_near_tabulated_value() {
        assert_relative_eq!(saturation_pressure(20.), 2339., max_relative = 5e-3);
        assert_relative_eq!(saturation_pressure(0.), 610.94);
    }

    #[rstest]
    fn should_give_humidity_ratio_at_saturation() {
        assert_relative_eq!(
            humidity_ratio_at_saturation(20., STANDARD_PRESSURE),
            0.01475,
            max_relative = 1e-2
        );
    }

    #[rstest]
    fn should_give_dry_air_density() {
        assert_relative_eq!(
            dry_air_density(STANDARD_PRESSURE, 20., 0.),
            1.204,
            max_relative = 1e-3
        );
    }

    #[rstest]
    fn latent_heat_falls_with_temperature() {
        assert!(latent_heat_of_vaporisation(30.) < latent_heat_of_vaporisation(10.));
    }
}
