use crate::compare_floats::{max_of_2, min_of_2};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct PortId(pub usize);

/// The plant network as seen from one water-system port.
pub trait PlantNetwork {
    /// Ask for a mass flow rate (kg/s) through the port; returns the flow the network grants.
    fn request_flow(&mut self, port: PortId, desired: f64) -> f64;
    /// Temperature of the water arriving at the port.
    fn boundary_temperature(&self, port: PortId) -> f64;
    /// When the loop flow is locked for this pass, the flow the port must accept.
    fn locked_flow(&self, port: PortId) -> Option<f64>;
    /// Report the flow and temperature leaving the component through the port.
    fn set_outlet_state(&mut self, port: PortId, mass_flow: f64, temperature: f64);
}

#[derive(Clone, Debug, PartialEq)]
struct BoundaryPort {
    name: String,
    supply_temperature: f64,
    max_flow: Option<f64>,
    link: Option<PortId>,
    follows_link_flow: bool,
    granted_flow: f64,
    outlet_flow: f64,
    outlet_temperature: Option<f64>,
}

/// A minimal plant network of fixed-temperature boundaries.
///
/// A port can be linked to another port: it then sees the other port's outlet temperature as its
/// inlet and, when `follows_link_flow` is set, has its flow locked to the flow the other port was
/// granted. This is enough to couple a draw circuit to the use side of a water heater.
#[derive(Clone, Debug, Default)]
pub struct FixedBoundaryPlant {
    ports: Vec<BoundaryPort>,
}

impl FixedBoundaryPlant {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add_port(
        &mut self,
        name: &str,
        supply_temperature: f64,
        max_flow: Option<f64>,
    ) -> PortId {
        self.ports.push(BoundaryPort {
            name: name.to_string(),
            supply_temperature,
            max_flow,
            link: None,
            follows_link_flow: false,
            granted_flow: 0.,
            outlet_flow: 0.,
            outlet_temperature: None,
        });
        PortId(self.ports.len() - 1)
    }

    pub fn link(&mut self, port: PortId, to: PortId, follows_link_flow: bool) {
        let port = &mut self.ports[port.0];
        port.link = Some(to);
        port.follows_link_flow = follows_link_flow;
    }

    pub fn port(&self, name: &str) -> Option<PortId> {
        self.ports
            .iter()
            .position(|port| port.name == name)
            .map(PortId)
    }

    pub fn set_supply_temperature(&mut self, port: PortId, temperature: f64) {
        self.ports[port.0].supply_temperature = temperature;
    }

    pub fn outlet_state(&self, port: PortId) -> (f64, Option<f64>) {
        let port = &self.ports[port.0];
        (port.outlet_flow, port.outlet_temperature)
    }
}

impl PlantNetwork for FixedBoundaryPlant {
    fn request_flow(&mut self, port: PortId, desired: f64) -> f64 {
        let port = &mut self.ports[port.0];
        let desired = max_of_2(desired, 0.);
        port.granted_flow = port
            .max_flow
            .map_or(desired, |max_flow| min_of_2(desired, max_flow));
        port.granted_flow
    }

    fn boundary_temperature(&self, port: PortId) -> f64 {
        let boundary = &self.ports[port.0];
        boundary
            .link
            .and_then(|link| self.ports[link.0].outlet_temperature)
            .unwrap_or(boundary.supply_temperature)
    }

    fn locked_flow(&self, port: PortId) -> Option<f64> {
        let boundary = &self.ports[port.0];
        match boundary.link {
            Some(link) if boundary.follows_link_flow => Some(self.ports[link.0].granted_flow),
            _ => None,
        }
    }

    fn set_outlet_state(&mut self, port: PortId, mass_flow: f64, temperature: f64) {
        let port = &mut self.ports[port.0];
        port.outlet_flow = mass_flow;
        port.outlet_temperature = Some(temperature);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::*;

    #[rstest]
    fn should_cap_granted_flow() {
        let mut plant = FixedBoundaryPlant::new();
        let port = plant.add_port("hot supply", 60., Some(0.1));

        assert_eq!(plant.request_flow(port, 0.25), 0.1);
        assert_eq!(plant.request_flow(port, 0.05), 0.05);
        assert_eq!(plant.request_flow(port, -1.), 0.);
        assert_eq!(plant.boundary_temperature(port), 60.);
        assert_eq!(plant.locked_flow(port), None);
    }

    #[rstest]
    fn linked_port_sees_outlet_temperature_and_flow() {
        let mut plant = FixedBoundaryPlant::new();
        let draw = plant.add_port("draw", 55., None);
        let heater_use = plant.add_port("heater use side", 10., None);
        plant.link(draw, heater_use, false);
        plant.link(heater_use, draw, true);

        assert_eq!(plant.boundary_temperature(draw), 55.);
        plant.request_flow(draw, 0.2);
        plant.set_outlet_state(draw, 0.2, 12.);
        plant.set_outlet_state(heater_use, 0.2, 58.);

        assert_eq!(plant.locked_flow(heater_use), Some(0.2));
        assert_eq!(plant.boundary_temperature(heater_use), 12.);
        assert_eq!(plant.boundary_temperature(draw), 58.);
        assert_eq!(plant.port("draw"), Some(draw));
        assert_eq!(plant.outlet_state(draw), (0.2, Some(12.)));
    }
}
