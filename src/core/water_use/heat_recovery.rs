//! Drain water heat recovery: a heat exchanger between the drain and the incoming cold water.

use crate::compare_floats::{max_of_2, min_of_2};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum HeatExchangerType {
    #[default]
    Ideal,
    CounterFlow,
    CrossFlow,
}

/// Where the preheated cold water goes.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum HeatRecoveryConfiguration {
    /// Preheats the water returned to the water heater
    #[default]
    Plant,
    /// Preheats the cold supply to the fixtures
    Equipment,
    PlantAndEquipment,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DrainHeatRecovery {
    pub heat_exchanger: HeatExchangerType,
    /// W/K
    pub ua: f64,
    pub configuration: HeatRecoveryConfiguration,
}

/// Flows through the connection that the heat exchanger sees, kg/s.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RecoveryFlows {
    pub hot: f64,
    pub cold: f64,
    pub total: f64,
    pub drain: f64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RecoveryOutcome {
    pub effectiveness: f64,
    /// W
    pub rate: f64,
    pub recovery_temperature: f64,
    pub waste_temperature: f64,
}

/// Effectiveness from the number of transfer units.
///
/// `c_ratio` is the ratio of the smaller to the larger capacity rate.
pub fn effectiveness(heat_exchanger: HeatExchangerType, ua: f64, c_min: f64, c_ratio: f64) -> f64 {
    if c_min <= 0. {
        return 0.;
    }
    let ntu = ua / c_min;
    match heat_exchanger {
        HeatExchangerType::Ideal => 1.,
        HeatExchangerType::CounterFlow => {
            if c_ratio == 1. {
                ntu / (1. + ntu)
            } else {
                let exp_val = (-ntu * (1. - c_ratio)).exp();
                (1. - exp_val) / (1. - c_ratio * exp_val)
            }
        }
        HeatExchangerType::CrossFlow => {
            1. - ((ntu.powf(0.22) / c_ratio) * ((-c_ratio * ntu.powf(0.78)).exp() - 1.)).exp()
        }
    }
}

impl DrainHeatRecovery {
    /// Mass flow through the cold side of the heat exchanger.
    pub fn recovery_mass_flow(&self, flows: &RecoveryFlows) -> f64 {
        match self.configuration {
            HeatRecoveryConfiguration::Plant => flows.hot,
            HeatRecoveryConfiguration::Equipment => flows.cold,
            HeatRecoveryConfiguration::PlantAndEquipment => flows.total,
        }
    }

    pub fn recover(
        &self,
        flows: &RecoveryFlows,
        drain_temperature: f64,
        cold_supply_temperature: f64,
        specific_heat: f64,
    ) -> RecoveryOutcome {
        if flows.total <= 0. {
            return RecoveryOutcome {
                effectiveness: 0.,
                rate: 0.,
                recovery_temperature: cold_supply_temperature,
                waste_temperature: drain_temperature,
            };
        }
        let hx_capacity_rate = specific_heat * self.recovery_mass_flow(flows);
        let drain_capacity_rate = specific_heat * flows.drain;
        let c_min = min_of_2(hx_capacity_rate, drain_capacity_rate);
        let c_max = max_of_2(hx_capacity_rate, drain_capacity_rate);
        let c_ratio = if c_max > 0. { c_min / c_max } else { 0. };

        let effectiveness = effectiveness(self.heat_exchanger, self.ua, c_min, c_ratio);
        let rate = effectiveness * c_min * (drain_temperature - cold_supply_temperature);
        let total_capacity_rate = specific_heat * flows.total;

        RecoveryOutcome {
            effectiveness,
            rate,
            recovery_temperature: cold_supply_temperature + rate / total_capacity_rate,
            waste_temperature: drain_temperature - rate / total_capacity_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use rstest::*;

    const CP: f64 = 4180.;

    #[rstest]
    #[case(HeatExchangerType::Ideal, 1.)]
    #[case(HeatExchangerType::CounterFlow, 0.)]
    #[case(HeatExchangerType::CrossFlow, 0.)]
    fn zero_ua_gives_no_effectiveness_unless_ideal(
        #[case] heat_exchanger: HeatExchangerType,
        #[case] expected: f64,
    ) {
        assert_eq!(effectiveness(heat_exchanger, 0., 400., 0.5), expected);
        assert_eq!(effectiveness(heat_exchanger, 0., 400., 1.), expected);
    }

    #[rstest]
    fn balanced_counterflow_uses_limit_form() {
        assert_relative_eq!(effectiveness(HeatExchangerType::CounterFlow, 400., 400., 1.), 0.5);
    }

    #[rstest]
    fn counterflow_matches_closed_form() {
        let (ntu, cr) = (1.5_f64, 0.4_f64);
        let expected = (1. - (-ntu * (1. - cr)).exp()) / (1. - cr * (-ntu * (1. - cr)).exp());
        assert_relative_eq!(
            effectiveness(HeatExchangerType::CounterFlow, ntu * 200., 200., cr),
            expected,
            max_relative = 1e-12
        );
    }

    #[rstest]
    fn no_capacity_gives_no_effectiveness() {
        assert_eq!(effectiveness(HeatExchangerType::Ideal, 100., 0., 0.), 0.);
    }

    #[rstest]
    #[case(10.)]
    #[case(100.)]
    #[case(1_000.)]
    #[case(10_000.)]
    fn effectiveness_stays_within_bounds(#[case] ua: f64) {
        for heat_exchanger in [HeatExchangerType::CounterFlow, HeatExchangerType::CrossFlow] {
            for c_ratio in [0.1, 0.5, 0.99, 1.] {
                let e = effectiveness(heat_exchanger, ua, 418., c_ratio);
                assert!((0. ..=1.).contains(&e), "{heat_exchanger:?} {ua} {c_ratio}: {e}");
            }
        }
    }

    #[rstest]
    fn recovery_conserves_heat_between_streams() {
        let recovery = DrainHeatRecovery {
            heat_exchanger: HeatExchangerType::CounterFlow,
            ua: 500.,
            configuration: HeatRecoveryConfiguration::PlantAndEquipment,
        };
        let flows = RecoveryFlows {
            hot: 0.06,
            cold: 0.04,
            total: 0.1,
            drain: 0.1,
        };

        let outcome = recovery.recover(&flows, 35., 10., CP);

        assert!(outcome.rate > 0.);
        assert_relative_eq!(
            (outcome.recovery_temperature - 10.) * CP * 0.1,
            outcome.rate,
            max_relative = 1e-12
        );
        assert_relative_eq!(
            (35. - outcome.waste_temperature) * CP * 0.1,
            outcome.rate,
            max_relative = 1e-12
        );
    }

    #[rstest]
    #[case(HeatRecoveryConfiguration::Plant, 0.06)]
    #[case(HeatRecoveryConfiguration::Equipment, 0.04)]
    #[case(HeatRecoveryConfiguration::PlantAndEquipment, 0.1)]
    fn recovery_flow_depends_on_configuration(
        #[case] configuration: HeatRecoveryConfiguration,
        #[case] expected: f64,
    ) {
        let recovery = DrainHeatRecovery {
            heat_exchanger: HeatExchangerType::Ideal,
            ua: 0.,
            configuration,
        };
        let flows = RecoveryFlows {
            hot: 0.06,
            cold: 0.04,
            total: 0.1,
            drain: 0.1,
        };
        assert_eq!(recovery.recovery_mass_flow(&flows), expected);
    }

    #[rstest]
    fn no_flow_recovers_nothing() {
        let recovery = DrainHeatRecovery {
            heat_exchanger: HeatExchangerType::Ideal,
            ua: 100.,
            configuration: HeatRecoveryConfiguration::Plant,
        };
        let outcome = recovery.recover(&RecoveryFlows::default(), 30., 10., CP);
        assert_eq!(
            outcome,
            RecoveryOutcome {
                effectiveness: 0.,
                rate: 0.,
                recovery_temperature: 10.,
                waste_temperature: 30.
            }
        );
    }
}
