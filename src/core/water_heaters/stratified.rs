//! Stratified tanks: a stack of equal-height layers, numbered from the top.
//!
//! Layers are advanced together by explicit sub-steps. Every heat flow in a sub-step is taken
//! from the same set of layer temperatures, so the heat crossing a boundary leaves one layer
//! exactly as it enters the other. Sub-steps are kept to a fraction of each layer's stability
//! limit, and end early where a heater element's sensing layer crosses a control threshold.

use crate::compare_floats::{max_of_2, min_of_2};
use crate::core::water_heaters::node::ThermalNode;
use crate::core::water_heaters::tank::{
    AuxiliaryHeat, ElementPriority, HeatDelivery, HeaterElement, InletMode, StepTotals,
    TankConditions, TankDiagnostic, TankMode, TankSide, TankStepResult, WaterHeater,
    MAX_ELEMENTS, TEMPERATURE_EPSILON, TIME_EPSILON,
};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Thermal conductivity of still water, W/(m.K)
pub(crate) const WATER_CONDUCTIVITY: f64 = 0.6;
pub(crate) const DEFAULT_INVERSION_MIXING_PASSES: usize = 30;
/// s
const MIN_SUBSTEP: f64 = 1.;
/// Share of the explicit stability limit `capacitance / conductance` used as the sub-step
const STABILITY_FRACTION: f64 = 0.25;
const MAX_SUBSTEPS: usize = 10_000;

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type", deny_unknown_fields)]
pub enum TankShape {
    #[default]
    VerticalCylinder,
    HorizontalCylinder,
    Other {
        /// m
        perimeter: f64,
    },
}

/// Dimensions and loss parameters from which the layers are built.
#[derive(Clone, Debug, PartialEq)]
pub struct StratifiedLayout {
    /// m3
    pub volume: f64,
    /// m
    pub height: f64,
    pub shape: TankShape,
    pub layer_count: usize,
    /// Skin loss per unit surface area, W/(m2.K)
    pub skin_loss_coefficient: f64,
    /// Added to the conductivity of water between layers, W/(m.K)
    pub additional_conductivity: f64,
    /// Extra loss coefficient per layer from the top, W/K
    pub additional_loss_coefficients: Vec<f64>,
    /// Applied to the top layer while no element is firing, W/K
    pub off_cycle_flue_loss_coefficient: f64,
    pub inversion_mixing_passes: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StratifiedTank {
    pub layers: Vec<ThermalNode>,
    pub shape: TankShape,
    /// m
    pub height: f64,
    pub inversion_mixing_passes: usize,
}

/// Heat flows into one layer at the start of a sub-step, W.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct LayerFlux {
    ambient: f64,
    heat: f64,
    /// From the use and source inflows entering this layer
    inflow: f64,
    /// Conduction and flow from the layers above and below
    neighbours: f64,
    /// Sum of every conductance acting on the layer, W/K
    conductance: f64,
}

impl LayerFlux {
    fn net(&self) -> f64 {
        self.ambient + self.heat + self.inflow + self.neighbours
    }
}

/// Flow crossing the boundaries of a layer, kg/s.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub(crate) struct LayerFlows {
    pub(crate) from_upper: f64,
    pub(crate) from_lower: f64,
}

impl StratifiedTank {
    pub fn new(layout: &StratifiedLayout, density: f64, initial_temperature: f64) -> Self {
        let n = layout.layer_count.max(1);
        let height = layout.height;
        let thickness = height / n as f64;
        let geometry = ShapeGeometry::new(layout.shape, layout.volume, height);

        // heights of the top and bottom of each layer, measured from the tank bottom
        let bounds = |i: usize| (height - i as f64 * thickness, height - (i + 1) as f64 * thickness);
        let conductivity = WATER_CONDUCTIVITY + layout.additional_conductivity;

        let layers = (0..n)
            .map(|i| {
                let (top, bottom) = bounds(i);
                let mut layer = ThermalNode::new(
                    i,
                    geometry.volume_between(bottom, top),
                    density,
                    initial_temperature,
                );
                layer.thickness = thickness;

                let ends = match geometry {
                    ShapeGeometry::Horizontal { .. } => 1.,
                    _ => f64::from(u8::from(i == 0) + u8::from(i == n - 1)),
                };
                let area =
                    geometry.side_area_between(bottom, top) + ends * geometry.end_area(&layer);
                let loss = layout.skin_loss_coefficient * area
                    + layout
                        .additional_loss_coefficients
                        .get(i)
                        .copied()
                        .unwrap_or_default();
                layer.on_cycle_loss_coefficient = loss;
                layer.off_cycle_loss_coefficient = if i == 0 {
                    loss + layout.off_cycle_flue_loss_coefficient
                } else {
                    loss
                };
                if thickness > 0. {
                    if i > 0 {
                        layer.conductance_up =
                            conductivity * geometry.cross_section_at(top) / thickness;
                    }
                    if i + 1 < n {
                        layer.conductance_down =
                            conductivity * geometry.cross_section_at(bottom) / thickness;
                    }
                }
                layer
            })
            .collect();

        Self {
            layers,
            shape: layout.shape,
            height,
            inversion_mixing_passes: layout.inversion_mixing_passes,
        }
    }

    /// Index of the layer containing `height`, measured from the tank bottom.
    pub fn layer_at_height(&self, height: f64) -> usize {
        let n = self.layers.len();
        if n == 0 || self.height <= 0. {
            return 0;
        }
        let thickness = self.height / n as f64;
        let from_top = ((self.height - height) / thickness).floor();
        (max_of_2(from_top, 0.) as usize).min(n - 1)
    }

    pub(crate) fn simulate(
        &self,
        tank: &WaterHeater,
        conditions: &TankConditions,
        auxiliary: &AuxiliaryHeat,
    ) -> TankStepResult {
        let n = self.layers.len();
        let cp = tank.specific_heat;
        let capacitances: Vec<f64> = self.layers.iter().map(|layer| layer.mass * cp).collect();
        let elements = &tank.heater.elements;
        let can_fire = tank.heater.can_fire(conditions.use_inflow.mass_flow);
        let mut diagnostics = vec![];

        let thresholds: Vec<(f64, f64)> = elements
            .iter()
            .zip(&conditions.setpoints)
            .map(|(element, &setpoint)| {
                let setpoint = if setpoint > tank.max_temperature {
                    diagnostics.push(TankDiagnostic::SetpointAboveMaximum { setpoint });
                    tank.max_temperature
                } else {
                    setpoint
                };
                (setpoint, setpoint - element.deadband)
            })
            .collect();

        let use_flow = conditions.use_inflow.mass_flow * tank.use_side.effectiveness;
        let source_flow = conditions.source_inflow.mass_flow * tank.source_side.effectiveness;

        let initial: Vec<f64> = self.layers.iter().map(|layer| layer.saved_temperature).collect();
        let mut temperatures = initial.clone();
        let mut integrals = vec![0.; n];
        let mut totals = StepTotals::default();
        let mut elements_on = tank.state.saved_elements_on;
        update_elements(
            &mut elements_on,
            &temperatures,
            elements,
            &thresholds,
            tank.heater.priority,
            can_fire,
            &mut totals.cycles,
        );

        let mut remaining = conditions.timestep;
        let mut substeps = 0;
        let mut mixing_failures = 0;
        let mut use_outlet_integral = 0.;
        let mut source_outlet_integral = 0.;
        let use_outlet = tank.use_side.outlet_layer.min(n - 1);
        let source_outlet = tank.source_side.outlet_layer.min(n - 1);

        while remaining > TIME_EPSILON {
            let forced = substeps >= MAX_SUBSTEPS;
            if forced && substeps == MAX_SUBSTEPS {
                diagnostics.push(TankDiagnostic::ExcessiveCycling { switches: substeps });
            }

            let use_inlet = inlet_layer(
                &tank.use_side,
                &temperatures,
                conditions.use_inflow.temperature,
            );
            let source_inlet = inlet_layer(
                &tank.source_side,
                &temperatures,
                conditions.source_inflow.temperature,
            );
            let flows = inter_layer_flows(
                n,
                (use_flow, use_inlet, use_outlet),
                (source_flow, source_inlet, source_outlet),
            );

            let firing = elements_on.iter().any(|&on| on);
            let mut heat = vec![0.; n];
            for (element, _) in elements
                .iter()
                .zip(elements_on)
                .filter(|(_, on)| *on)
            {
                heat[element.layer.min(n - 1)] += element.capacity;
            }
            let parasitic = if firing {
                &tank.on_cycle_parasitic
            } else {
                &tank.off_cycle_parasitic
            };
            heat[parasitic.layer.min(n - 1)] += parasitic.heat_to_tank();
            match &auxiliary.delivery {
                HeatDelivery::SourceInlet => heat[source_inlet] += auxiliary.rate,
                HeatDelivery::Distributed(fractions) => {
                    for (layer_heat, fraction) in heat.iter_mut().zip(fractions) {
                        *layer_heat += auxiliary.rate * fraction;
                    }
                }
            }

            let fluxes: Vec<LayerFlux> = (0..n)
                .map(|i| {
                    let layer = &self.layers[i];
                    let loss_coefficient = layer.loss_coefficient(firing);
                    let mut flux = LayerFlux {
                        ambient: loss_coefficient
                            * (conditions.ambient_temperature - temperatures[i]),
                        heat: heat[i],
                        conductance: loss_coefficient,
                        ..Default::default()
                    };
                    if i == use_inlet {
                        flux.inflow += use_flow * cp * (conditions.use_inflow.temperature - temperatures[i]);
                        flux.conductance += use_flow * cp;
                    }
                    if i == source_inlet {
                        flux.inflow +=
                            source_flow * cp * (conditions.source_inflow.temperature - temperatures[i]);
                        flux.conductance += source_flow * cp;
                    }
                    // both layers of a boundary see the same temperatures, so what one gains the
                    // other loses
                    if i > 0 {
                        let conductance = layer.conductance_up + flows[i].from_upper * cp;
                        flux.neighbours += conductance * (temperatures[i - 1] - temperatures[i]);
                        flux.conductance += conductance;
                    }
                    if i + 1 < n {
                        let conductance = layer.conductance_down + flows[i].from_lower * cp;
                        flux.neighbours += conductance * (temperatures[i + 1] - temperatures[i]);
                        flux.conductance += conductance;
                    }
                    flux
                })
                .collect();
            let rates: Vec<f64> = fluxes
                .iter()
                .zip(&capacitances)
                .map(|(flux, capacitance)| flux.net() / capacitance)
                .collect();

            let mut duration = remaining;
            for (flux, capacitance) in fluxes.iter().zip(&capacitances) {
                if flux.conductance > 0. {
                    duration = min_of_2(duration, STABILITY_FRACTION * capacitance / flux.conductance);
                }
            }
            if !forced && can_fire {
                for ((element, &(setpoint, cut_in)), on) in
                    elements.iter().zip(&thresholds).zip(elements_on)
                {
                    let layer = element.layer.min(n - 1);
                    let target = if on { setpoint } else { cut_in };
                    let gap = target - temperatures[layer];
                    if gap * rates[layer] > 0. {
                        let time = gap / rates[layer];
                        if time > TIME_EPSILON {
                            duration = min_of_2(duration, max_of_2(time, MIN_SUBSTEP));
                        }
                    }
                }
            }
            let duration = min_of_2(duration, remaining);

            let fraction_to_zone = if firing {
                tank.losses.on_cycle_fraction_to_zone
            } else {
                tank.losses.off_cycle_fraction_to_zone
            };
            let mut next = Vec::with_capacity(n);
            for (((flux, rate), temperature), integral) in
                fluxes.iter().zip(&rates).zip(&temperatures).zip(&mut integrals)
            {
                *integral += temperature * duration + 0.5 * rate * duration * duration;
                totals.energy.ambient += flux.ambient * duration;
                totals.energy.heat += flux.heat * duration;
                totals.zone_loss_energy += -flux.ambient * duration * fraction_to_zone;
                next.push(temperature + rate * duration);
            }
            // the advected heat telescopes through the layers to inflow less outflow on each side
            let use_energy =
                use_flow * cp * (conditions.use_inflow.temperature - temperatures[use_outlet]) * duration;
            let source_energy = source_flow
                * cp
                * (conditions.source_inflow.temperature - temperatures[source_outlet])
                * duration;
            let exchanged: f64 = fluxes
                .iter()
                .map(|flux| (flux.inflow + flux.neighbours) * duration)
                .sum();
            totals.energy.use_side += use_energy;
            totals.energy.source_side += source_energy;
            totals.energy.neighbours += exchanged - use_energy - source_energy;
            use_outlet_integral += temperatures[use_outlet] * duration;
            source_outlet_integral += temperatures[source_outlet] * duration;

            for k in 0..elements.len().min(MAX_ELEMENTS) {
                if elements_on[k] {
                    totals.heater_energy[k] += elements[k].capacity * duration;
                    totals.on_time[k] += duration;
                }
            }
            if firing {
                totals.on_cycle_time += duration;
            }
            totals.auxiliary_energy += auxiliary.rate * duration;

            if !tank.is_chilled() {
                for (temperature, capacitance) in next.iter_mut().zip(&capacitances) {
                    if *temperature > tank.max_temperature {
                        totals.vent_energy += capacitance * (*temperature - tank.max_temperature);
                        *temperature = tank.max_temperature;
                    }
                }
            }
            if !self.mix_inversions(&mut next) {
                mixing_failures += 1;
            }
            temperatures = next;

            update_elements(
                &mut elements_on,
                &temperatures,
                elements,
                &thresholds,
                tank.heater.priority,
                can_fire,
                &mut totals.cycles,
            );
            remaining -= duration;
            substeps += 1;
        }

        if mixing_failures > 0 {
            diagnostics.push(TankDiagnostic::MixingNotConverged {
                passes: self.inversion_mixing_passes,
            });
        }

        totals.stored_energy_change = capacitances
            .iter()
            .zip(temperatures.iter().zip(&initial))
            .map(|(capacitance, (end, start))| capacitance * (end - start))
            .sum();
        let averages: Vec<f64> = if conditions.timestep > 0. {
            integrals.iter().map(|integral| integral / conditions.timestep).collect()
        } else {
            temperatures.clone()
        };
        let mode = if elements_on.iter().any(|&on| on) {
            TankMode::Heat
        } else if totals.vent_energy > 0. {
            TankMode::Vent
        } else {
            TankMode::Float
        };

        let (use_outlet, source_outlet) = if conditions.timestep > 0. {
            (
                use_outlet_integral / conditions.timestep,
                source_outlet_integral / conditions.timestep,
            )
        } else {
            (temperatures[use_outlet], temperatures[source_outlet])
        };

        let average_temperature = self.volume_weighted(&averages);
        let final_temperature = self.volume_weighted(&temperatures);
        let report = tank.build_report(
            conditions,
            &totals,
            average_temperature,
            final_temperature,
            use_outlet,
            source_outlet,
        );

        TankStepResult {
            final_temperatures: temperatures,
            average_temperatures: averages,
            mode,
            elements_on,
            ignition_remaining: 0.,
            report,
            diagnostics,
        }
    }

    fn volume_weighted(&self, values: &[f64]) -> f64 {
        crate::core::water_heaters::tank::volume_weighted_values(&self.layers, values)
    }

    /// Mix any layer that is warmer than the layer above it with the layers it rises through,
    /// repeating until the stack is stable. Returns false if inversions remain.
    pub(crate) fn mix_inversions(&self, temperatures: &mut [f64]) -> bool {
        let volumes: Vec<f64> = self.layers.iter().map(|layer| layer.volume).collect();
        for _ in 0..self.inversion_mixing_passes.max(1) {
            if !has_inversion(temperatures) {
                return true;
            }
            mix_once(temperatures, &volumes);
        }
        !has_inversion(temperatures)
    }
}

fn has_inversion(temperatures: &[f64]) -> bool {
    temperatures
        .windows(2)
        .any(|pair| pair[1] > pair[0] + TEMPERATURE_EPSILON)
}

/// One pass from the bottom layer up, mixing each inverted pair with the run of layers
/// already mixed below it.
fn mix_once(temperatures: &mut [f64], volumes: &[f64]) {
    let n = temperatures.len();
    let mut mixing = vec![false; n];
    for i in (1..n).rev() {
        if temperatures[i] > temperatures[i - 1] {
            mixing[i] = true;
            mixing[i - 1] = true;
            let (heat, volume) = (0..n)
                .filter(|&k| mixing[k])
                .fold((0., 0.), |(heat, volume), k| {
                    (heat + volumes[k] * temperatures[k], volume + volumes[k])
                });
            let mixed = heat / volume;
            for k in (i - 1..n).filter(|&k| mixing[k]) {
                temperatures[k] = mixed;
            }
        } else {
            mixing = vec![false; n];
        }
    }
}

/// The layer an inflow enters for this sub-step.
fn inlet_layer(side: &TankSide, temperatures: &[f64], inflow_temperature: f64) -> usize {
    let fixed = side.inlet_layer.min(temperatures.len().saturating_sub(1));
    match side.inlet_mode {
        InletMode::Fixed => fixed,
        InletMode::Seeking => temperatures
            .iter()
            .enumerate()
            .map(|(i, t)| (i, (t - inflow_temperature).abs()))
            .fold((fixed, (temperatures[fixed] - inflow_temperature).abs()), |best, candidate| {
                if candidate.1 < best.1 {
                    candidate
                } else {
                    best
                }
            })
            .0,
    }
}

/// Net flow between neighbouring layers driven by the use and source sides, each given as
/// (mass flow, inlet layer, outlet layer).
pub(crate) fn inter_layer_flows(
    n: usize,
    use_side: (f64, usize, usize),
    source_side: (f64, usize, usize),
) -> Vec<LayerFlows> {
    let mut flows = vec![LayerFlows::default(); n];
    for (mass_flow, inlet, outlet) in [use_side, source_side] {
        if mass_flow <= 0. {
            continue;
        }
        if inlet > outlet {
            // enters below the outlet so water moves up through the layers in between
            for flow in &mut flows[outlet..inlet] {
                flow.from_lower += mass_flow;
            }
        } else if outlet > inlet {
            for flow in &mut flows[inlet + 1..=outlet] {
                flow.from_upper += mass_flow;
            }
        }
    }
    // opposing flows across a boundary cancel to a single net flow
    for i in 0..n.saturating_sub(1) {
        let net = flows[i].from_lower - flows[i + 1].from_upper;
        if net > 0. {
            flows[i].from_lower = net;
            flows[i + 1].from_upper = 0.;
        } else {
            flows[i].from_lower = 0.;
            flows[i + 1].from_upper = -net;
        }
    }
    flows
}

/// Switch elements on and off from their sensing layers and count the starts.
fn update_elements(
    on: &mut [bool; MAX_ELEMENTS],
    temperatures: &[f64],
    elements: &[HeaterElement],
    thresholds: &[(f64, f64)],
    priority: ElementPriority,
    can_fire: bool,
    cycles: &mut [u32; MAX_ELEMENTS],
) {
    let previous = *on;
    for (k, (element, &(setpoint, cut_in))) in
        elements.iter().zip(thresholds).enumerate().take(MAX_ELEMENTS)
    {
        let temperature = temperatures[element.layer.min(temperatures.len() - 1)];
        if !can_fire || element.capacity <= 0. {
            on[k] = false;
        } else if on[k] && temperature >= setpoint - TEMPERATURE_EPSILON {
            on[k] = false;
        } else if !on[k] && temperature <= cut_in + TEMPERATURE_EPSILON {
            on[k] = true;
        }
    }
    if priority == ElementPriority::MasterSlave && on[0] {
        on[1] = false;
    }
    for ((count, now), before) in cycles.iter_mut().zip(*on).zip(previous) {
        if now && !before {
            *count += 1;
        }
    }
}

enum ShapeGeometry {
    Vertical { radius: f64, height: f64 },
    Horizontal { radius: f64, length: f64 },
    Prism { perimeter: f64, area: f64 },
}

impl ShapeGeometry {
    fn new(shape: TankShape, volume: f64, height: f64) -> Self {
        match shape {
            TankShape::VerticalCylinder => Self::Vertical {
                radius: (volume / (PI * height)).sqrt(),
                height,
            },
            TankShape::HorizontalCylinder => {
                let radius = height / 2.;
                Self::Horizontal {
                    radius,
                    length: volume / (PI * radius * radius),
                }
            }
            TankShape::Other { perimeter } => Self::Prism {
                perimeter,
                area: volume / height,
            },
        }
    }

    /// Area of the circular segment below height `h` of a horizontal cylinder end.
    fn segment_area(radius: f64, h: f64) -> f64 {
        let h = h.clamp(0., 2. * radius);
        let d = radius - h;
        radius * radius * (d / radius).clamp(-1., 1.).acos() - d * (2. * radius * h - h * h).max(0.).sqrt()
    }

    fn volume_between(&self, bottom: f64, top: f64) -> f64 {
        match *self {
            Self::Vertical { radius, .. } => PI * radius * radius * (top - bottom),
            Self::Horizontal { radius, length } => {
                length * (Self::segment_area(radius, top) - Self::segment_area(radius, bottom))
            }
            Self::Prism { area, .. } => area * (top - bottom),
        }
    }

    fn side_area_between(&self, bottom: f64, top: f64) -> f64 {
        match *self {
            Self::Vertical { radius, .. } => 2. * PI * radius * (top - bottom),
            Self::Horizontal { radius, length } => {
                let angle = |h: f64| ((radius - h.clamp(0., 2. * radius)) / radius).acos();
                length * 2. * radius * (angle(top) - angle(bottom))
            }
            Self::Prism { perimeter, .. } => perimeter * (top - bottom),
        }
    }

    /// End area added to a layer: a cap for the top and bottom layers of upright shapes, both
    /// end segments for every layer of a horizontal cylinder.
    fn end_area(&self, layer: &ThermalNode) -> f64 {
        match *self {
            Self::Vertical { radius, .. } => PI * radius * radius,
            Self::Horizontal { length, .. } => {
                if length > 0. {
                    2. * layer.volume / length
                } else {
                    0.
                }
            }
            Self::Prism { area, .. } => area,
        }
    }

    fn cross_section_at(&self, h: f64) -> f64 {
        match *self {
            Self::Vertical { radius, .. } => PI * radius * radius,
            Self::Horizontal { radius, length } => {
                let d = radius - h;
                2. * (radius * radius - d * d).max(0.).sqrt() * length
            }
            Self::Prism { area, .. } => area,
        }
    }
}
