//! Macroscopic state of the segment and its cell transmission stepping rule.

use crate::config::SegmentConfig;
use crate::error::{Error, Result};
use crate::flow::FundamentalDiagram;
use crate::math::LookupTable;
use crate::metrics::Scenario;
use crate::sample::{timestamp_format, SensorSample};
use crate::util::Interval;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Spacing of the flow table nodes, in veh/km.
const TABLE_STEP: f64 = 0.25;

/// Densities below this count as an empty cell, in veh/km.
const EMPTY_DENSITY: f64 = 1e-9;

/// One cell of the segment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    /// In veh/km.
    pub density: f64,
    /// In km/h.
    pub speed: f64,
}

/// Conditions at the ends of the segment for one step.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Boundary {
    /// The time at the end of the step.
    pub at: NaiveDateTime,
    /// Vehicles arriving upstream during the step.
    pub inflow_vehicles: f64,
    /// Density just past the end of the segment, in veh/km. `None` means free outflow.
    pub downstream_density: Option<f64>,
}

/// Vehicles moved across the segment boundaries by one step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub entered: f64,
    pub exited: f64,
    pub substeps: usize,
}

/// An immutable copy of a [TrafficState] for consumers outside the simulation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrafficSnapshot {
    pub scenario: Scenario,
    #[serde(with = "timestamp_format")]
    pub timestamp: NaiveDateTime,
    /// In km/h.
    pub speed_limit: f64,
    pub cells: Vec<Cell>,
    /// Vehicles waiting to enter the segment.
    pub queue: f64,
    /// Mean cell speed, in km/h.
    pub mean_speed: f64,
    /// Vehicles on the segment.
    pub vehicles: f64,
    /// Vehicles leaving the segment during the last step, per hour.
    pub throughput: f64,
}

/// Sending and receiving capacities of a cell under one speed limit.
#[derive(Clone, Debug)]
struct FlowTable {
    speed_limit: f64,
    demand: LookupTable,
    supply: LookupTable,
    /// Fastest characteristic speed, in km/h.
    wave_speed: f64,
}

impl FlowTable {
    fn new(diagram: &FundamentalDiagram, speed_limit: f64) -> Self {
        let range = Interval::new(0.0, diagram.jam_density());
        let flow = LookupTable::from_fn(range, TABLE_STEP, |k| {
            f64::min(diagram.intensity(k), speed_limit * k)
        });
        let step = flow.node(1) - flow.node(0);
        let wave_speed = flow
            .values()
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).abs() / step)
            .fold(0.0, f64::max);
        Self {
            speed_limit,
            demand: flow.running_max(),
            supply: flow.running_max_rev(),
            wave_speed,
        }
    }
}

/// The macroscopic state of one scenario: a row of cells plus the limit in force.
#[derive(Clone, Debug)]
pub struct TrafficState {
    scenario: Scenario,
    diagram: Arc<FundamentalDiagram>,
    table: FlowTable,
    cells: Vec<Cell>,
    /// In km.
    cell_length: f64,
    /// Vehicles waiting to enter.
    queue: f64,
    speed_limit: f64,
    initial_density: f64,
    initial_limit: f64,
    /// Cells denser than this discharge at reduced capacity, in veh/km.
    critical_density: f64,
    capacity_drop: f64,
    tolerance: f64,
    /// Outflow of the last step, in veh/h.
    throughput: f64,
}

impl TrafficState {
    /// Creates a state with every cell at `initial_density`.
    pub fn new(
        scenario: Scenario,
        diagram: Arc<FundamentalDiagram>,
        segment: &SegmentConfig,
        critical_density: f64,
        speed_limit: f64,
        initial_density: f64,
        tolerance: f64,
    ) -> Self {
        let table = FlowTable::new(&diagram, speed_limit);
        let mut state = Self {
            scenario,
            diagram,
            table,
            cells: vec![Cell::default(); segment.cells],
            cell_length: segment.length_km / segment.cells as f64,
            queue: 0.0,
            speed_limit,
            initial_density,
            initial_limit: speed_limit,
            critical_density,
            capacity_drop: segment.capacity_drop,
            tolerance,
            throughput: 0.0,
        };
        state.reset();
        state
    }

    pub fn scenario(&self) -> Scenario {
        self.scenario
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn speed_limit(&self) -> f64 {
        self.speed_limit
    }

    pub fn queue(&self) -> f64 {
        self.queue
    }

    /// Vehicles currently on the segment.
    pub fn vehicles(&self) -> f64 {
        self.cells.iter().map(|c| c.density).sum::<f64>() * self.cell_length
    }

    /// Mean cell speed, in km/h.
    pub fn mean_speed(&self) -> f64 {
        self.cells.iter().map(|c| c.speed).sum::<f64>() / self.cells.len() as f64
    }

    /// Length of the segment, in km.
    pub fn length(&self) -> f64 {
        self.cell_length * self.cells.len() as f64
    }

    /// Restores the state the scenario started from.
    pub fn reset(&mut self) {
        self.set_speed_limit(self.initial_limit);
        self.queue = 0.0;
        self.throughput = 0.0;
        let density = self.initial_density;
        for cell in &mut self.cells {
            cell.density = density;
        }
        self.update_speeds();
    }

    fn set_speed_limit(&mut self, speed_limit: f64) {
        if speed_limit != self.table.speed_limit {
            self.table = FlowTable::new(&self.diagram, speed_limit);
        }
        self.speed_limit = speed_limit;
    }

    /// Overwrites the state with an observed sample, uniformly along the segment.
    pub fn replay(&mut self, sample: &SensorSample, dt: f64) -> StepReport {
        for cell in &mut self.cells {
            *cell = Cell {
                density: sample.density,
                speed: sample.speed,
            };
        }
        self.queue = 0.0;
        self.throughput = sample.intensity;
        let vehicles = sample.vehicles_over(dt / 3600.0);
        StepReport {
            entered: vehicles,
            exited: vehicles,
            substeps: 0,
        }
    }

    /// Advances the state by `dt` seconds with the given speed limit as a hard cap.
    ///
    /// The step is split into substeps short enough that no wave crosses more than one
    /// cell per substep. Fails with [`Error::SimulationDivergence`] if vehicles are
    /// created or lost, in which case the state is left as it was before the step.
    pub fn step(&mut self, dt: f64, speed_limit: f64, boundary: &Boundary) -> Result<StepReport> {
        self.set_speed_limit(speed_limit);
        let hours = dt / 3600.0;
        let substeps = ((hours * self.table.wave_speed / self.cell_length).ceil() as usize).max(1);
        let h = hours / substeps as f64;
        let arrivals = boundary.inflow_vehicles.max(0.0) / substeps as f64;
        let ghost_supply = self
            .table
            .supply
            .sample(boundary.downstream_density.unwrap_or(0.0));

        let before = self.vehicles();
        let mut densities: Vec<f64> = self.cells.iter().map(|c| c.density).collect();
        let mut queue = self.queue;
        let mut flows = vec![0.0; densities.len() + 1];
        let mut report = StepReport {
            substeps,
            ..Default::default()
        };

        for _ in 0..substeps {
            queue += arrivals;
            flows[0] = f64::min(queue / h, self.table.supply.sample(densities[0]));
            for i in 1..densities.len() {
                flows[i] = f64::min(self.demand(densities[i - 1]), self.table.supply.sample(densities[i]));
            }
            let last = densities.len() - 1;
            flows[last + 1] = f64::min(self.demand(densities[last]), ghost_supply);

            for (i, density) in densities.iter_mut().enumerate() {
                *density += h / self.cell_length * (flows[i] - flows[i + 1]);
            }
            queue -= flows[0] * h;
            report.entered += flows[0] * h;
            report.exited += flows[last + 1] * h;
        }

        let after = densities.iter().sum::<f64>() * self.cell_length;
        let drift = (before + report.entered - report.exited - after).abs();
        if !drift.is_finite() || drift > self.tolerance {
            return Err(Error::SimulationDivergence {
                scenario: self.scenario,
                timestamp: boundary.at,
                drift,
            });
        }

        for (cell, density) in self.cells.iter_mut().zip(densities) {
            cell.density = density;
        }
        self.queue = queue.max(0.0);
        self.throughput = report.exited / hours;
        self.update_speeds();
        Ok(report)
    }

    /// Sending capacity of a cell, reduced once the cell is congested.
    fn demand(&self, density: f64) -> f64 {
        let demand = self.table.demand.sample(density);
        if density > self.critical_density {
            demand * (1.0 - self.capacity_drop)
        } else {
            demand
        }
    }

    fn update_speeds(&mut self) {
        let limit = self.speed_limit;
        let free_flow = self.diagram.free_flow_speed();
        for cell in &mut self.cells {
            let speed = if cell.density <= EMPTY_DENSITY {
                free_flow
            } else {
                self.diagram.speed(cell.density)
            };
            cell.speed = speed.min(limit).max(0.0);
        }
    }

    pub fn snapshot(&self, timestamp: NaiveDateTime) -> TrafficSnapshot {
        TrafficSnapshot {
            scenario: self.scenario,
            timestamp,
            speed_limit: self.speed_limit,
            cells: self.cells.clone(),
            queue: self.queue,
            mean_speed: self.mean_speed(),
            vehicles: self.vehicles(),
            throughput: self.throughput,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use chrono::NaiveDate;

    fn at() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2019, 1, 16)
            .and_then(|d| d.and_hms_opt(8, 0, 0))
            .unwrap()
    }

    fn state(initial_density: f64, speed_limit: f64) -> TrafficState {
        let diagram = Arc::new(FundamentalDiagram::greenshields(100.0, 180.0));
        TrafficState::new(
            Scenario::Optimized,
            diagram,
            &SegmentConfig::default(),
            90.0,
            speed_limit,
            initial_density,
            1e-6,
        )
    }

    #[test]
    fn conserves_vehicles() {
        let mut state = state(30.0, 90.0);
        let inflows = [500.0, 1200.0, 0.0, 800.0, 2000.0, 300.0];
        let downstream = [None, Some(20.0), Some(150.0), Some(170.0), None, Some(60.0)];
        for (inflow, downstream) in inflows.iter().zip(downstream) {
            let queued = state.queue();
            let before = state.vehicles();
            let boundary = Boundary {
                at: at(),
                inflow_vehicles: *inflow,
                downstream_density: downstream,
            };
            let report = state.step(900.0, 90.0, &boundary).unwrap();
            assert!(report.substeps >= 1);
            assert_approx_eq!(before + report.entered, state.vehicles() + report.exited, 1e-6);
            assert_approx_eq!(queued + inflow, state.queue() + report.entered, 1e-6);
            assert!(state.cells().iter().all(|c| c.density >= -1e-9));
        }
    }

    #[test]
    fn speed_never_exceeds_limit() {
        let mut state = state(10.0, 70.0);
        assert!(state.cells().iter().all(|c| c.speed <= 70.0));
        let boundary = Boundary {
            at: at(),
            inflow_vehicles: 100.0,
            downstream_density: None,
        };
        state.step(900.0, 50.0, &boundary).unwrap();
        assert_eq!(state.speed_limit(), 50.0);
        assert!(state.cells().iter().all(|c| c.speed <= 50.0));
    }

    #[test]
    fn speed_falls_with_density() {
        let sparse = state(20.0, 200.0);
        let dense = state(120.0, 200.0);
        assert!(dense.mean_speed() < sparse.mean_speed());
    }

    #[test]
    fn empty_segment_stays_empty() {
        let mut state = state(0.0, 90.0);
        let boundary = Boundary {
            at: at(),
            inflow_vehicles: 0.0,
            downstream_density: None,
        };
        let report = state.step(900.0, 90.0, &boundary).unwrap();
        assert_eq!(report.exited, 0.0);
        assert_eq!(state.vehicles(), 0.0);
        assert_eq!(state.mean_speed(), 90.0);
    }

    #[test]
    fn blocked_exit_fills_the_segment() {
        let mut state = state(40.0, 90.0);
        let boundary = Boundary {
            at: at(),
            inflow_vehicles: 3000.0,
            downstream_density: Some(180.0),
        };
        let report = state.step(900.0, 90.0, &boundary).unwrap();
        assert_approx_eq!(report.exited, 0.0);
        assert!(state.vehicles() > 80.0);
        assert!(state.queue() > 0.0);
    }

    #[test]
    fn replay_mirrors_the_sample() {
        let mut state = state(0.0, 90.0);
        let sample = SensorSample {
            timestamp: at(),
            segment_id: "a".to_string(),
            intensity: 2000.0,
            density: 40.0,
            speed: 50.0,
            is_holiday: false,
            is_raining: false,
        };
        let report = state.replay(&sample, 900.0);
        assert_approx_eq!(report.exited, 500.0);
        assert_approx_eq!(state.mean_speed(), 50.0);
        assert_approx_eq!(state.vehicles(), 80.0);

        let snapshot = state.snapshot(at());
        assert_approx_eq!(snapshot.throughput, 2000.0);
        state.reset();
        assert_eq!(state.vehicles(), 0.0);
    }
}
