//! Closed-form solution of the lumped-capacitance energy balance of one body of water.
//!
//! Over an interval in which flows, heat input and surroundings are constant, a well-mixed node
//! obeys
//!
//! `C dT/dt = UA (Ta - T) + m1 cp (T1 - T) + m2 cp (T2 - T) + G (Tn - T) + Q`
//!
//! where `G (Tn - T)` collects exchange with neighbouring layers of a stratified tank. This is
//! `dT/dt = b - a T` with constant `a >= 0`, solved exactly below, including its time integral so
//! that mean temperatures and energies over the interval need no quadrature.

use serde::{Deserialize, Serialize};

/// Below this value of `a t` the exponential terms are evaluated by series expansion.
const SMALL_EXPONENT: f64 = 1e-8;

/// A flow entering the node at a fixed temperature.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Inflow {
    /// kg/s
    pub mass_flow: f64,
    /// deg C
    pub temperature: f64,
}

impl Inflow {
    pub fn new(mass_flow: f64, temperature: f64) -> Self {
        Self {
            mass_flow,
            temperature,
        }
    }
}

/// Exchange with a fixed-temperature neighbour, as a conductance in W/K.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Coupling {
    pub conductance: f64,
    pub temperature: f64,
}

impl Coupling {
    /// Combine two couplings into one with the same total exchange at every node temperature.
    pub fn combine(self, other: Coupling) -> Coupling {
        let conductance = self.conductance + other.conductance;
        if conductance <= 0. {
            return Coupling::default();
        }
        Coupling {
            conductance,
            temperature: (self.conductance * self.temperature
                + other.conductance * other.temperature)
                / conductance,
        }
    }
}

/// `dT/dt = b - a T`
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NodeEquation {
    a: f64,
    b: f64,
}

/// `(1 - exp(-a t)) / a`, equal to `t` when `a` is zero
fn phi(a: f64, t: f64) -> f64 {
    if (a * t).abs() < SMALL_EXPONENT {
        t * (1. - 0.5 * a * t)
    } else {
        -(-a * t).exp_m1() / a
    }
}

/// `(t - phi(a, t)) / a`, equal to `t^2 / 2` when `a` is zero
fn psi(a: f64, t: f64) -> f64 {
    if (a * t).abs() < SMALL_EXPONENT {
        t * t * (0.5 - a * t / 6.)
    } else {
        (t - phi(a, t)) / a
    }
}

impl NodeEquation {
    pub fn new(a: f64, b: f64) -> Self {
        Self { a, b }
    }

    /// Inverse time constant, 1/s
    pub fn decay_rate(&self) -> f64 {
        self.a
    }

    /// The temperature the node tends towards, if it has any flow or loss at all.
    pub fn steady_state(&self) -> Option<f64> {
        (self.a > 0.).then(|| self.b / self.a)
    }

    pub fn temperature_after(&self, initial: f64, time: f64) -> f64 {
        initial + (self.b - self.a * initial) * phi(self.a, time)
    }

    /// Integral of temperature over `[0, time]`, in K.s
    pub fn temperature_integral(&self, initial: f64, time: f64) -> f64 {
        initial * time + (self.b - self.a * initial) * psi(self.a, time)
    }

    /// Time for the node to move from `initial` to `target`, or `None` if it never gets there.
    pub fn time_to_reach(&self, initial: f64, target: f64) -> Option<f64> {
        let rise = target - initial;
        if rise == 0. {
            return Some(0.);
        }
        let initial_rate = self.b - self.a * initial;
        if initial_rate == 0. || rise.signum() != initial_rate.signum() {
            return None;
        }
        if self.a == 0. {
            return Some(rise / initial_rate);
        }
        // fraction of the gap to steady state that has to be closed
        let fraction = rise * self.a / initial_rate;
        if fraction >= 1. {
            return None;
        }
        Some(-(-fraction).ln_1p() / self.a)
    }
}

/// Heat flows into a node over an interval, in J. Positive values warm the node.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SegmentEnergy {
    pub ambient: f64,
    pub use_side: f64,
    pub source_side: f64,
    pub neighbours: f64,
    pub heat: f64,
}

impl SegmentEnergy {
    pub fn total(&self) -> f64 {
        self.ambient + self.use_side + self.source_side + self.neighbours + self.heat
    }

    pub fn accumulate(&mut self, other: &SegmentEnergy) {
        self.ambient += other.ambient;
        self.use_side += other.use_side;
        self.source_side += other.source_side;
        self.neighbours += other.neighbours;
        self.heat += other.heat;
    }
}

/// Result of advancing a node over one interval.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Segment {
    pub duration: f64,
    pub final_temperature: f64,
    pub average_temperature: f64,
    /// Integral of temperature over the interval, in K.s
    pub temperature_integral: f64,
    pub energy: SegmentEnergy,
}

/// All inputs to the governing equation of one node over one interval.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NodeBalance {
    /// Thermal mass m cp, in J/K
    pub capacitance: f64,
    pub specific_heat: f64,
    /// UA to ambient, in W/K
    pub loss_coefficient: f64,
    pub ambient_temperature: f64,
    pub use_inflow: Inflow,
    pub source_inflow: Inflow,
    pub neighbours: Coupling,
    /// Heater, heat pump and parasitic heat not carried by a flow, in W
    pub heat: f64,
}

impl NodeBalance {
    pub fn equation(&self) -> NodeEquation {
        let use_conductance = self.use_inflow.mass_flow * self.specific_heat;
        let source_conductance = self.source_inflow.mass_flow * self.specific_heat;
        let a = (self.loss_coefficient
            + use_conductance
            + source_conductance
            + self.neighbours.conductance)
            / self.capacitance;
        let b = (self.loss_coefficient * self.ambient_temperature
            + use_conductance * self.use_inflow.temperature
            + source_conductance * self.source_inflow.temperature
            + self.neighbours.conductance * self.neighbours.temperature
            + self.heat)
            / self.capacitance;
        NodeEquation::new(a, b)
    }

    /// Advance the node from `initial` over `duration` seconds.
    pub fn advance(&self, initial: f64, duration: f64) -> Segment {
        let equation = self.equation();
        let final_temperature = equation.temperature_after(initial, duration);
        let integral = equation.temperature_integral(initial, duration);
        let exchange = |conductance: f64, temperature: f64| {
            conductance * (temperature * duration - integral)
        };
        let cp = self.specific_heat;

        Segment {
            duration,
            final_temperature,
            average_temperature: if duration > 0. {
                integral / duration
            } else {
                initial
            },
            temperature_integral: integral,
            energy: SegmentEnergy {
                ambient: exchange(self.loss_coefficient, self.ambient_temperature),
                use_side: exchange(
                    self.use_inflow.mass_flow * cp,
                    self.use_inflow.temperature,
                ),
                source_side: exchange(
                    self.source_inflow.mass_flow * cp,
                    self.source_inflow.temperature,
                ),
                neighbours: exchange(self.neighbours.conductance, self.neighbours.temperature),
                heat: self.heat * duration,
            },
        }
    }

    /// Heat input that would hold the node exactly at `temperature`, in W.
    pub fn heat_to_hold(&self, temperature: f64) -> f64 {
        let without_heat = NodeBalance { heat: 0., ..*self }.equation();
        (without_heat.decay_rate() * temperature - without_heat.b) * self.capacitance
    }
}

/// One well-mixed body of water: the whole of a mixed tank, or one layer of a stratified tank.
#[derive(Clone, Debug, PartialEq)]
pub struct ThermalNode {
    /// Layer index counted from the top; 0 for mixed tanks
    pub layer: usize,
    /// m3
    pub volume: f64,
    /// kg
    pub mass: f64,
    /// Height of the layer, in m
    pub thickness: f64,
    pub temperature: f64,
    pub saved_temperature: f64,
    pub average_temperature: f64,
    /// W/K
    pub on_cycle_loss_coefficient: f64,
    /// W/K
    pub off_cycle_loss_coefficient: f64,
    /// Conductance to the layer above, W/K
    pub conductance_up: f64,
    /// Conductance to the layer below, W/K
    pub conductance_down: f64,
}

impl ThermalNode {
    pub fn new(layer: usize, volume: f64, density: f64, temperature: f64) -> Self {
        Self {
            layer,
            volume,
            mass: volume * density,
            thickness: 0.,
            temperature,
            saved_temperature: temperature,
            average_temperature: temperature,
            on_cycle_loss_coefficient: 0.,
            off_cycle_loss_coefficient: 0.,
            conductance_up: 0.,
            conductance_down: 0.,
        }
    }

    pub fn loss_coefficient(&self, heater_firing: bool) -> f64 {
        if heater_firing {
            self.on_cycle_loss_coefficient
        } else {
            self.off_cycle_loss_coefficient
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::*;

    const CP: f64 = 4180.;

    fn balance(mass: f64, ua: f64, ambient: f64, heat: f64) -> NodeBalance {
        NodeBalance {
            capacitance: mass * CP,
            specific_heat: CP,
            loss_coefficient: ua,
            ambient_temperature: ambient,
            use_inflow: Inflow::default(),
            source_inflow: Inflow::default(),
            neighbours: Coupling::default(),
            heat,
        }
    }

    #[rstest]
    #[case(5., 300., 60., 22., 3600.)]
    #[case(2.5, 150., 45., 15., 86400.)]
    #[case(40., 80., 10., 30., 7200.)]
    #[case(0.1, 1000., 82., -5., 900.)]
    fn should_decay_exponentially_towards_ambient(
        #[case] ua: f64,
        #[case] mass: f64,
        #[case] initial: f64,
        #[case] ambient: f64,
        #[case] time: f64,
    ) {
        let segment = balance(mass, ua, ambient, 0.).advance(initial, time);

        let expected = ambient + (initial - ambient) * (-ua * time / (mass * CP)).exp();
        assert_relative_eq!(segment.final_temperature, expected, max_relative = 1e-12);
    }

    #[rstest]
    fn should_heat_linearly_without_flow_or_loss() {
        let segment = balance(300., 0., 22., 4500.).advance(55., 600.);

        assert_relative_eq!(segment.final_temperature, 55. + 4500. * 600. / (300. * CP));
        assert_relative_eq!(
            segment.average_temperature,
            55. + 0.5 * 4500. * 600. / (300. * CP)
        );
    }

    #[rstest]
    #[case(0.)]
    #[case(0.05)]
    #[case(0.4)]
    fn should_conserve_energy_over_a_segment(#[case] use_flow: f64) {
        let node = NodeBalance {
            use_inflow: Inflow::new(use_flow, 10.),
            source_inflow: Inflow::new(0.02, 70.),
            neighbours: Coupling {
                conductance: 12.,
                temperature: 40.,
            },
            ..balance(300., 5., 22., 4500.)
        };
        let initial = 55.;

        let segment = node.advance(initial, 1800.);

        let stored = node.capacitance * (segment.final_temperature - initial);
        let residual = (stored - segment.energy.total()).abs();
        assert!(residual <= 1e-6 * segment.energy.total().abs().max(stored.abs()));
    }

    #[rstest]
    fn splitting_an_interval_gives_the_same_end_temperature() {
        let node = NodeBalance {
            use_inflow: Inflow::new(0.1, 10.),
            ..balance(200., 3., 20., 3000.)
        };
        let whole = node.advance(50., 3600.);
        let first = node.advance(50., 1234.);
        let second = node.advance(first.final_temperature, 3600. - 1234.);

        assert_relative_eq!(whole.final_temperature, second.final_temperature, max_relative = 1e-12);
        assert_relative_eq!(
            whole.temperature_integral,
            first.temperature_integral + second.temperature_integral,
            max_relative = 1e-10
        );
    }

    #[rstest]
    fn time_to_reach_inverts_temperature_after() {
        let equation = balance(300., 5., 22., 4500.).equation();

        let time = equation.time_to_reach(55., 60.).unwrap();

        assert_relative_eq!(equation.temperature_after(55., time), 60., max_relative = 1e-12);
    }

    #[rstest]
    fn time_to_reach_is_none_beyond_steady_state_or_moving_away() {
        let cooling = balance(300., 5., 22., 0.).equation();
        assert_eq!(cooling.time_to_reach(55., 60.), None);
        assert_eq!(cooling.time_to_reach(55., 21.), None);
        assert!(cooling.time_to_reach(55., 23.).is_some());
        assert_eq!(cooling.time_to_reach(55., 55.), Some(0.));

        let isolated = balance(300., 0., 22., 0.).equation();
        assert_eq!(isolated.time_to_reach(55., 60.), None);
    }

    #[rstest]
    fn heat_to_hold_balances_losses() {
        let node = balance(300., 5., 22., 0.);
        assert_relative_eq!(node.heat_to_hold(60.), 5. * (60. - 22.));

        let held = NodeBalance {
            heat: node.heat_to_hold(60.),
            ..node
        };
        assert_relative_eq!(held.advance(60., 3600.).final_temperature, 60., max_relative = 1e-12);
    }

    #[rstest]
    fn couplings_combine_by_conductance() {
        let combined = Coupling {
            conductance: 1.,
            temperature: 10.,
        }
        .combine(Coupling {
            conductance: 3.,
            temperature: 30.,
        });
        assert_relative_eq!(combined.conductance, 4.);
        assert_relative_eq!(combined.temperature, 25.);
    }
}
