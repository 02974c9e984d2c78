use crate::core::agent::{Agent, ConsultThrottle};
use crate::core::events::{EmitOptions, EventBus, EventKind, EventPayload, Priority, SimEvent};
use crate::core::physics::{self, PhysicsResult};
use crate::core::strategy::heuristic::HeuristicPolicy;
use crate::core::strategy::remote::{ProviderRegistry, RemotePolicy};
use crate::core::strategy::{
    DecisionContext, Hazard, OvertakeIntent, PitIntent, Policy, PolicyPars, RaceProgress,
    SurroundingVehicle, Surroundings, MAX_AHEAD, MAX_BEHIND, MAX_NEARBY,
};
use crate::core::track::{ObstacleMarker, Track, TrackPars};
use crate::core::vehicle::{ControlInputs, Vehicle, VehiclePars};
use crate::core::weather::{sample_normal, Weather};
use crate::interfaces::snapshot_interface::{
    PendingEvent, RaceSnapshot, SnapshotCallback, VehicleSummary,
};
use crate::post::race_result::{ClassificationEntry, RaceEvent, RaceResult};
use anyhow::Context;
use helpers::general::{argsort, clamp_or, clamp_unit, SortOrder};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Maximum number of ticks run by a single call of `Race::advance`.
pub const MAX_TICKS_PER_FRAME: u32 = 1000;
pub const MIN_SPEED_MULTIPLIER: f64 = 0.1;
pub const MAX_SPEED_MULTIPLIER: f64 = 10.0;
/// Below this energy level battery-low events can occur.
const BATTERY_LOW_LEVEL: f64 = 0.2;

fn default_weather_change() -> f64 {
    0.5
}

fn default_breakdown() -> f64 {
    0.01
}

fn default_battery_low() -> f64 {
    0.5
}

fn default_collision() -> f64 {
    0.05
}

fn default_obstacle() -> f64 {
    0.2
}

/// Probabilities per minute of race time for the stochastic events.
/// * `weather_change` - Weather change
/// * `breakdown` - Breakdown, per vehicle
/// * `battery_low` - Battery-low warning, per vehicle below 20% energy
/// * `collision` - Collision, per pair of vehicles within the collision proximity
/// * `obstacle` - Obstacle appearing somewhere on the track
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct EventRates {
    #[serde(default = "default_weather_change")]
    pub weather_change: f64,
    #[serde(default = "default_breakdown")]
    pub breakdown: f64,
    #[serde(default = "default_battery_low")]
    pub battery_low: f64,
    #[serde(default = "default_collision")]
    pub collision: f64,
    #[serde(default = "default_obstacle")]
    pub obstacle: f64,
}

impl Default for EventRates {
    fn default() -> Self {
        EventRates {
            weather_change: default_weather_change(),
            breakdown: default_breakdown(),
            battery_low: default_battery_low(),
            collision: default_collision(),
            obstacle: default_obstacle(),
        }
    }
}

impl EventRates {
    /// none disables all stochastic events.
    pub fn none() -> Self {
        EventRates {
            weather_change: 0.0,
            breakdown: 0.0,
            battery_low: 0.0,
            collision: 0.0,
            obstacle: 0.0,
        }
    }
}

fn default_grid_spacing() -> f64 {
    0.5
}

fn default_collision_proximity() -> f64 {
    3.0
}

fn default_true() -> bool {
    true
}

fn default_obstacle_ttl() -> f64 {
    30.0
}

fn default_boost_multiplier() -> f64 {
    1.03
}

fn default_overtake_multiplier() -> f64 {
    1.02
}

/// * `tot_no_laps` - Race distance in laps
/// * `seed` - Seed of the random number generator, drawn from entropy if not set
/// * `grid_spacing_m` - (m) Start offset between two consecutive vehicles of the roster
/// * `event_rates` - Per-minute probabilities of the stochastic events
/// * `collision_proximity_m` - (m) Gap below which two vehicles can collide
/// * `obstacle_single_use` - Obstacles are consumed by the first vehicle hitting them, otherwise
/// every vehicle hits them once until they expire
/// * `obstacle_ttl_s` - (s) Lifetime of an obstacle
/// * `weather` - Weather at the race start
/// * `boost_multiplier` - Transient speed factor of an activated boost
/// * `overtake_multiplier` - Transient speed factor during an overtaking attempt
#[derive(Debug, Deserialize, Clone)]
pub struct RacePars {
    pub tot_no_laps: u32,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default = "default_grid_spacing")]
    pub grid_spacing_m: f64,
    #[serde(default)]
    pub event_rates: EventRates,
    #[serde(default = "default_collision_proximity")]
    pub collision_proximity_m: f64,
    #[serde(default = "default_true")]
    pub obstacle_single_use: bool,
    #[serde(default = "default_obstacle_ttl")]
    pub obstacle_ttl_s: f64,
    #[serde(default)]
    pub weather: Weather,
    #[serde(default = "default_boost_multiplier")]
    pub boost_multiplier: f64,
    #[serde(default = "default_overtake_multiplier")]
    pub overtake_multiplier: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RaceStatus {
    Stopped,
    Running,
    Paused,
    Finished,
}

/// The part of the race state the event handlers operate on.
#[derive(Debug)]
pub struct RaceWorld {
    pub agents: Vec<Agent>,
    pub track: Track,
    pub weather: Weather,
    pub racetime: f64,
    pub event_log: Vec<RaceEvent>,
}

impl RaceWorld {
    pub fn agent_mut(&mut self, vehicle_id: u32) -> Option<&mut Agent> {
        self.agents.iter_mut().find(|a| a.vehicle.id == vehicle_id)
    }

    /// leader_lap returns the highest number of completed laps of all vehicles.
    pub fn leader_lap(&self) -> u32 {
        self.agents
            .iter()
            .map(|a| a.vehicle.sh.get_compl_lap())
            .max()
            .unwrap_or(0)
    }

    fn log_event(&mut self, event: &SimEvent, vehicles: Vec<u32>) {
        let lap = self.leader_lap() + 1;
        self.event_log.push(RaceEvent {
            kind: event.kind,
            time_s: event.timestamp,
            lap,
            vehicles,
        });
    }
}

/// subscribe_default_handlers registers the handlers through which events act on the race.
fn subscribe_default_handlers(events: &mut EventBus<RaceWorld>) {
    events.subscribe(EventKind::Breakdown, |event, world, _| {
        let severity = match &event.payload {
            EventPayload::Breakdown { severity } => clamp_unit(*severity),
            _ => return Ok(()),
        };
        let id = event.target.context("Breakdown without target vehicle")?;
        let agent = world
            .agent_mut(id)
            .with_context(|| format!("Breakdown of unknown vehicle {}", id))?;

        agent.vehicle.speed *= 1.0 - severity;
        log::info!("Vehicle {} broke down (severity {:.2})", id, severity);
        world.log_event(event, vec![id]);
        Ok(())
    });

    events.subscribe(EventKind::Collision, |event, world, _| {
        let (other, severity) = match &event.payload {
            EventPayload::Collision { other, severity } => (*other, clamp_unit(*severity)),
            _ => return Ok(()),
        };
        let id = event.target.context("Collision without target vehicle")?;

        for vehicle_id in [id, other] {
            let agent = world
                .agent_mut(vehicle_id)
                .with_context(|| format!("Collision of unknown vehicle {}", vehicle_id))?;
            agent.vehicle.speed *= 0.7;
            agent.vehicle.tireset.add_damage(0.1 * severity);
        }
        log::info!("Vehicles {} and {} collided (severity {:.2})", id, other, severity);
        world.log_event(event, vec![id, other]);
        Ok(())
    });

    events.subscribe(EventKind::ObstacleAppear, |event, world, _| {
        let (segment, severity, ttl) = match &event.payload {
            EventPayload::ObstacleAppear {
                segment,
                severity,
                ttl,
            } => (*segment, clamp_unit(*severity), *ttl),
            _ => return Ok(()),
        };
        let marker = ObstacleMarker {
            severity,
            appeared_at: event.timestamp,
            expires_at: event.timestamp + ttl.max(0.0),
            hit_by: Vec::new(),
        };

        if !world.track.place_obstacle(segment, marker) {
            anyhow::bail!("Obstacle on unknown segment {}", segment);
        }
        log::info!("Obstacle (severity {:.2}) appeared on segment {}", severity, segment);
        world.log_event(event, Vec::new());
        Ok(())
    });

    events.subscribe(EventKind::BatteryLow, |event, world, _| {
        if let (EventPayload::BatteryLow { level }, Some(id)) = (&event.payload, event.target) {
            log::info!("Vehicle {} reports low energy ({:.1}%)", id, level * 100.0);
            world.log_event(event, vec![id]);
        }
        Ok(())
    });

    events.subscribe(EventKind::OvertakeAttempt, |event, world, _| {
        if let EventPayload::OvertakeAttempt { attacker, defender } = &event.payload {
            log::debug!("Vehicle {} attacks {:?}", attacker, defender);
            let mut vehicles = vec![*attacker];
            vehicles.extend(defender.iter().copied());
            world.log_event(event, vehicles);
        }
        Ok(())
    });

    events.subscribe(EventKind::PitStop, |event, world, _| {
        if let (EventPayload::PitStop { duration }, Some(id)) = (&event.payload, event.target) {
            log::info!("Vehicle {} entered the pits for {:.1}s", id, duration);
            world.log_event(event, vec![id]);
        }
        Ok(())
    });

    events.subscribe(EventKind::WeatherChange, |event, world, _| {
        if let EventPayload::WeatherChange { previous, current } = &event.payload {
            log::info!(
                "Weather changed from {:?} to {:?} (intensity {:.2})",
                previous.kind,
                current.kind,
                current.intensity
            );
            world.log_event(event, Vec::new());
        }
        Ok(())
    });
}

/// State of a vehicle as seen by the others, taken at the start of a tick.
#[derive(Debug, Clone)]
struct VehicleView {
    id: u32,
    speed: f64,
    race_distance: f64,
    pitting: bool,
}

/// build_agent creates the agent for a roster entry. Remote policies whose provider is not
/// registered are replaced by the heuristic.
fn build_agent(vehicle_pars: &VehiclePars, providers: &ProviderRegistry) -> Agent {
    let vehicle = Vehicle::new(vehicle_pars);

    match &vehicle_pars.policy {
        PolicyPars::Heuristic => Agent::new(vehicle, Policy::Heuristic(HeuristicPolicy::default())),
        PolicyPars::Remote {
            provider,
            timeout_ms,
            consult_interval,
        } => match providers.get(provider) {
            Some(provider) => Agent::new(
                vehicle,
                Policy::Remote(RemotePolicy::new(
                    provider,
                    Duration::from_millis(*timeout_ms),
                )),
            )
            .with_consult_throttle(ConsultThrottle::new(*consult_interval)),
            None => {
                log::warn!(
                    "Decision provider {} of vehicle {} is not registered, using heuristic policy",
                    provider,
                    vehicle_pars.id
                );
                Agent::new(vehicle, Policy::Heuristic(HeuristicPolicy::default()))
            }
        },
    }
}

pub struct Race {
    pub timestep_size: f64,
    pub tot_no_laps: u32,
    pub world: RaceWorld,
    events: EventBus<RaceWorld>,
    race_pars: RacePars,
    vehicle_pars_all: Vec<VehiclePars>,
    providers: ProviderRegistry,
    seed: u64,
    rng: ChaCha8Rng,
    status: RaceStatus,
    speed_multiplier: f64,
    accumulator: f64,
    tick_count: u64,
    snapshot_callback: Option<SnapshotCallback>,
}

impl fmt::Debug for Race {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Race")
            .field("timestep_size", &self.timestep_size)
            .field("tot_no_laps", &self.tot_no_laps)
            .field("status", &self.status)
            .field("tick_count", &self.tick_count)
            .field("seed", &self.seed)
            .field("world", &self.world)
            .field("events", &self.events)
            .finish()
    }
}

impl Race {
    pub fn new(
        race_pars: &RacePars,
        track_pars: &TrackPars,
        vehicle_pars_all: &[VehiclePars],
        providers: &ProviderRegistry,
        timestep_size: f64,
    ) -> Race {
        let seed = race_pars.seed.unwrap_or_else(rand::random);

        let mut events = EventBus::new();
        subscribe_default_handlers(&mut events);

        let mut race = Race {
            timestep_size,
            tot_no_laps: race_pars.tot_no_laps,
            world: RaceWorld {
                agents: Vec::new(),
                track: Track::new(track_pars),
                weather: race_pars.weather.clone(),
                racetime: 0.0,
                event_log: Vec::new(),
            },
            events,
            race_pars: race_pars.clone(),
            vehicle_pars_all: Vec::new(),
            providers: providers.clone(),
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
            status: RaceStatus::Stopped,
            speed_multiplier: 1.0,
            accumulator: 0.0,
            tick_count: 0,
            snapshot_callback: None,
        };

        race.initialize(vehicle_pars_all);
        race
    }

    /// start_offset returns the start position (m) of the vehicle at the given roster index.
    fn start_offset(&self, idx: usize) -> f64 {
        idx as f64 * self.race_pars.grid_spacing_m.max(0.0)
    }

    /// initialize (re)builds all agents from the roster, places them on the grid and resets time,
    /// weather, events and the random number generator.
    pub fn initialize(&mut self, vehicle_pars_all: &[VehiclePars]) {
        self.vehicle_pars_all = vehicle_pars_all.to_vec();

        let mut agents: Vec<Agent> = vehicle_pars_all
            .iter()
            .map(|pars| build_agent(pars, &self.providers))
            .collect();

        for (idx, agent) in agents.iter_mut().enumerate() {
            agent.vehicle.place_on_track(&self.world.track, self.start_offset(idx));
        }

        self.world.agents = agents;
        self.rewind();

        log::debug!(
            "Initialized race with {} vehicles on {} ({:.0}m), seed {}",
            self.world.agents.len(),
            self.world.track.name,
            self.world.track.lap_length(),
            self.seed
        );
    }

    /// rewind resets everything but the agents.
    fn rewind(&mut self) {
        self.world.weather = self.race_pars.weather.clone();
        self.world.racetime = 0.0;
        self.world.event_log.clear();
        self.world.track.clear_obstacles();
        self.events.clear();
        self.rng = ChaCha8Rng::seed_from_u64(self.seed);
        self.status = RaceStatus::Stopped;
        self.accumulator = 0.0;
        self.tick_count = 0;
    }

    // ---------------------------------------------------------------------------------------------
    // CONTROL SURFACE -----------------------------------------------------------------------------
    // ---------------------------------------------------------------------------------------------

    /// start begins the race. It is a no-op unless the race is stopped and both the roster and the
    /// track are non-empty. Returns true if the race is running afterwards.
    pub fn start(&mut self) -> bool {
        if self.status != RaceStatus::Stopped {
            log::debug!("Race cannot be started from status {:?}", self.status);
            return false;
        }
        if self.world.agents.is_empty() || self.world.track.is_empty() {
            log::warn!("Race cannot be started without vehicles and track segments");
            return false;
        }

        self.status = RaceStatus::Running;
        log::info!(
            "Race started: {} vehicles, {} laps on {}",
            self.world.agents.len(),
            self.tot_no_laps,
            self.world.track.name
        );
        true
    }

    pub fn pause(&mut self) {
        if self.status == RaceStatus::Running {
            self.status = RaceStatus::Paused;
            log::info!("Race paused at {:.2}s", self.world.racetime);
        }
    }

    pub fn resume(&mut self) {
        if self.status == RaceStatus::Paused {
            self.status = RaceStatus::Running;
            log::info!("Race resumed at {:.2}s", self.world.racetime);
        }
    }

    /// stop halts the loop. A finished race stays finished.
    pub fn stop(&mut self) {
        if self.status != RaceStatus::Finished {
            self.status = RaceStatus::Stopped;
        }
        self.accumulator = 0.0;
    }

    /// reset stops the race, respawns all vehicles on the grid, restores the initial weather and
    /// emits one snapshot.
    pub fn reset(&mut self) {
        self.stop();

        let starts: Vec<f64> = (0..self.world.agents.len())
            .map(|idx| self.start_offset(idx))
            .collect();
        for (agent, start) in self.world.agents.iter_mut().zip(starts) {
            agent.reset(&self.world.track, start);
        }

        self.rewind();
        log::info!("Race reset");
        self.emit_snapshot();
    }

    /// set_speed_multiplier sets the ratio of simulated to wall time, clamped to [0.1, 10.0].
    pub fn set_speed_multiplier(&mut self, multiplier: f64) {
        self.speed_multiplier = clamp_or(
            multiplier,
            MIN_SPEED_MULTIPLIER,
            MAX_SPEED_MULTIPLIER,
            self.speed_multiplier,
        );
    }

    pub fn set_snapshot_callback<F>(&mut self, callback: F)
    where
        F: FnMut(RaceSnapshot) + Send + 'static,
    {
        self.snapshot_callback = Some(Box::new(callback));
    }

    pub fn clear_snapshot_callback(&mut self) {
        self.snapshot_callback = None;
    }

    /// events_mut gives access to the event bus, e.g. to subscribe additional handlers or to
    /// inject events.
    pub fn events_mut(&mut self) -> &mut EventBus<RaceWorld> {
        &mut self.events
    }

    pub fn events(&self) -> &EventBus<RaceWorld> {
        &self.events
    }

    pub fn status(&self) -> RaceStatus {
        self.status
    }

    pub fn speed_multiplier(&self) -> f64 {
        self.speed_multiplier
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn cur_racetime(&self) -> f64 {
        self.world.racetime
    }

    pub fn vehicle_pars(&self) -> &[VehiclePars] {
        &self.vehicle_pars_all
    }

    // ---------------------------------------------------------------------------------------------
    // MAIN METHODS --------------------------------------------------------------------------------
    // ---------------------------------------------------------------------------------------------

    /// advance feeds elapsed wall time (s), scaled by the speed multiplier, into the fixed timestep
    /// accumulator and runs a tick for every full timestep in it. Returns the number of ticks run.
    pub fn advance(&mut self, wall_dt: f64) -> u32 {
        if self.status != RaceStatus::Running || !(wall_dt > 0.0) || !(self.timestep_size > 0.0) {
            return 0;
        }

        self.accumulator += wall_dt * self.speed_multiplier;
        let mut no_ticks = 0;

        while self.accumulator >= self.timestep_size - 1e-12 && self.status == RaceStatus::Running {
            if no_ticks >= MAX_TICKS_PER_FRAME {
                log::warn!(
                    "Could not keep up, dropping {:.3}s of simulated time",
                    self.accumulator
                );
                self.accumulator = 0.0;
                break;
            }

            self.tick(self.timestep_size);
            self.accumulator = (self.accumulator - self.timestep_size).max(0.0);
            no_ticks += 1;
        }

        no_ticks
    }

    /// tick simulates one timestep of the given size (s).
    pub fn tick(&mut self, dt: f64) {
        if self.status == RaceStatus::Finished
            || !(dt > 0.0)
            || self.world.agents.is_empty()
            || self.world.track.is_empty()
        {
            return;
        }

        // advance time
        self.tick_count += 1;
        self.world.racetime += dt;
        let now = self.world.racetime;

        // due events act on the world
        self.events.process(now, &mut self.world);
        self.world.track.expire_obstacles(now);

        // stochastic weather and events
        self.update_weather(dt);
        self.inject_events(dt);

        // vehicles, based on the state at the start of the tick
        let views = self.vehicle_views();
        let weather = self.world.weather.clone();
        let track = self.world.track.clone();
        let order_before = self.running_order();

        for idx in 0..self.world.agents.len() {
            let emitted = self.step_vehicle(idx, &views, &track, &weather, dt);
            for (payload, opts) in emitted {
                self.events.emit(payload, opts);
            }
        }

        self.count_position_changes(&order_before);
        self.check_completion();
        self.emit_snapshot();
    }

    // ---------------------------------------------------------------------------------------------
    // RACE SIMULATOR PARTS ------------------------------------------------------------------------
    // ---------------------------------------------------------------------------------------------

    fn chance(&mut self, rate_per_min: f64, dt: f64) -> bool {
        let p = clamp_unit(rate_per_min * dt / 60.0);
        p > 0.0 && self.rng.gen_bool(p)
    }

    fn update_weather(&mut self, dt: f64) {
        if !self.chance(self.race_pars.event_rates.weather_change, dt) {
            return;
        }

        let previous = self.world.weather.clone();
        let current = previous.evolve(&mut self.rng);

        if current != previous {
            self.world.weather = current.clone();
            self.events.emit(
                EventPayload::WeatherChange { previous, current },
                EmitOptions::default().with_priority(Priority::High),
            );
        }
    }

    fn inject_events(&mut self, dt: f64) {
        let rates = self.race_pars.event_rates.clone();
        let racing: Vec<(u32, f64, f64)> = self
            .world
            .agents
            .iter()
            .filter(|a| !a.vehicle.is_pitting())
            .map(|a| {
                (
                    a.vehicle.id,
                    a.vehicle.energy_level(),
                    a.vehicle.sh.race_distance(&self.world.track),
                )
            })
            .collect();

        for &(id, energy, _) in racing.iter() {
            if self.chance(rates.breakdown, dt) {
                let severity = (0.3 + sample_normal(&mut self.rng, 0.1)).clamp(0.1, 0.9);
                self.events.emit(
                    EventPayload::Breakdown { severity },
                    EmitOptions::targeting(id).with_priority(Priority::High),
                );
            }

            if energy < BATTERY_LOW_LEVEL && self.chance(rates.battery_low, dt) {
                self.events.emit(
                    EventPayload::BatteryLow { level: energy },
                    EmitOptions::targeting(id).with_priority(Priority::Low),
                );
            }
        }

        for (i, &(id_a, _, dist_a)) in racing.iter().enumerate() {
            for &(id_b, _, dist_b) in racing.iter().skip(i + 1) {
                if (dist_a - dist_b).abs() < self.race_pars.collision_proximity_m
                    && self.chance(rates.collision, dt)
                {
                    let severity = self.rng.gen_range(0.1..0.8);
                    self.events.emit(
                        EventPayload::Collision {
                            other: id_b,
                            severity,
                        },
                        EmitOptions::targeting(id_a).with_priority(Priority::Critical),
                    );
                }
            }
        }

        if self.chance(rates.obstacle, dt) {
            let segment = self.rng.gen_range(0..self.world.track.len());
            let severity = self.rng.gen_range(0.1..0.6);
            self.events.emit(
                EventPayload::ObstacleAppear {
                    segment,
                    severity,
                    ttl: self.race_pars.obstacle_ttl_s,
                },
                EmitOptions::default(),
            );
        }
    }

    fn vehicle_views(&self) -> Vec<VehicleView> {
        self.world
            .agents
            .iter()
            .map(|a| VehicleView {
                id: a.vehicle.id,
                speed: a.vehicle.speed,
                race_distance: a.vehicle.sh.race_distance(&self.world.track),
                pitting: a.vehicle.is_pitting(),
            })
            .collect()
    }

    /// running_order returns the roster indices sorted by race distance, leader first.
    fn running_order(&self) -> Vec<usize> {
        let distances: Vec<f64> = self
            .world
            .agents
            .iter()
            .map(|a| a.vehicle.sh.race_distance(&self.world.track))
            .collect();
        argsort(&distances, SortOrder::Descending)
    }

    fn surroundings(idx: usize, views: &[VehicleView]) -> Surroundings {
        let own = &views[idx];
        let mut ahead = Vec::new();
        let mut behind = Vec::new();
        let mut nearby = Vec::new();

        for (j, other) in views.iter().enumerate() {
            if j == idx || other.pitting {
                continue;
            }
            let gap = other.race_distance - own.race_distance;
            let seen = SurroundingVehicle {
                id: other.id,
                speed: other.speed,
                distance: gap.abs(),
            };

            if gap > 0.0 {
                ahead.push(seen.clone());
            } else if gap < 0.0 {
                behind.push(seen.clone());
            }
            nearby.push(seen);
        }

        let by_distance = |a: &SurroundingVehicle, b: &SurroundingVehicle| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        };
        ahead.sort_by(by_distance);
        behind.sort_by(by_distance);
        nearby.sort_by(by_distance);
        ahead.truncate(MAX_AHEAD);
        behind.truncate(MAX_BEHIND);
        nearby.truncate(MAX_NEARBY);

        Surroundings {
            ahead,
            behind,
            nearby,
        }
    }

    /// build_context assembles the decision context from the given track and weather state, which
    /// during a tick are the ones from its start.
    fn build_context(
        &self,
        idx: usize,
        views: &[VehicleView],
        track: &Track,
        weather: &Weather,
    ) -> Option<DecisionContext> {
        let vehicle = &self.world.agents.get(idx)?.vehicle;
        let seg_idx = vehicle.sh.get_cur_segment();
        let segment = track.segment(seg_idx)?;
        let next_idx = track.next_segment_idx(seg_idx);
        let next_segment = track.segment(next_idx)?;

        let mut hazards = Vec::new();
        if let Some(obstacle) = &segment.obstacle {
            hazards.push(Hazard {
                segment: seg_idx,
                severity: obstacle.severity,
                distance: 0.0,
            });
        }
        if next_idx != seg_idx {
            if let Some(obstacle) = &next_segment.obstacle {
                hazards.push(Hazard {
                    segment: next_idx,
                    severity: obstacle.severity,
                    distance: (1.0 - vehicle.sh.get_seg_progress()) * segment.length,
                });
            }
        }

        Some(DecisionContext {
            vehicle: vehicle.clone(),
            surroundings: Race::surroundings(idx, views),
            segment: segment.clone(),
            next_segment_heading: next_segment.heading(),
            lap_length: track.lap_length(),
            weather: weather.clone(),
            progress: RaceProgress {
                current_lap: vehicle.sh.get_compl_lap() + 1,
                total_laps: self.tot_no_laps,
                elapsed: self.world.racetime,
            },
            hazards,
        })
    }

    /// decision_context builds the context the agent at the given roster index decides on, based
    /// on the current state.
    pub fn decision_context(&self, idx: usize) -> Option<DecisionContext> {
        let views = self.vehicle_views();
        self.build_context(idx, &views, &self.world.track, &self.world.weather)
    }

    /// step_vehicle handles a single vehicle for one tick: pit standstill, or decision, physics,
    /// progress and pit entry. Returns the events caused by the decision.
    fn step_vehicle(
        &mut self,
        idx: usize,
        views: &[VehicleView],
        track: &Track,
        weather: &Weather,
        dt: f64,
    ) -> Vec<(EventPayload, EmitOptions)> {
        let now = self.world.racetime;
        let mut emitted = Vec::new();

        if self.world.agents[idx].vehicle.is_pitting() {
            let vehicle = &mut self.world.agents[idx].vehicle;
            vehicle.speed = 0.0;
            vehicle.acceleration = 0.0;
            vehicle.racetime = now;

            if vehicle.sh.update_pit(dt) {
                vehicle.perform_pitstop(weather.rain_intensity());
                log::info!(
                    "Vehicle {} left the pits on {:?} tires at {:.2}s",
                    vehicle.id,
                    vehicle.tireset.compound,
                    now
                );
            }
            return emitted;
        }

        let ctx = match self.build_context(idx, views, track, weather) {
            Some(ctx) => ctx,
            None => {
                log::warn!("No decision context for vehicle at index {}", idx);
                return emitted;
            }
        };

        let boost_multiplier = self.race_pars.boost_multiplier.max(1.0);
        let overtake_multiplier = self.race_pars.overtake_multiplier.max(1.0);
        let agent = &mut self.world.agents[idx];

        // decision
        let mut decision = agent.decide(&ctx);
        if !agent.vehicle.is_raceable() {
            decision.pit_stop = PitIntent::Immediate;
        }
        let vehicle = &mut agent.vehicle;
        let controls = ControlInputs::from(&decision);

        // physics
        let mut result = physics::simulate_step(vehicle, &ctx.segment, weather, &controls, dt);
        if !result.is_finite() {
            log::warn!("Non-finite physics result for vehicle {}, keeping its speed", vehicle.id);
            result = PhysicsResult {
                speed: vehicle.speed,
                battery_drain: vehicle.energy.consumption_rate,
                ..PhysicsResult::default()
            };
        }

        // transient boosts
        if decision.boost {
            result.speed *= boost_multiplier;
        }
        if decision.overtaking == OvertakeIntent::Attempt {
            result.speed *= overtake_multiplier;
            emitted.push((
                EventPayload::OvertakeAttempt {
                    attacker: vehicle.id,
                    defender: ctx.surroundings.ahead.first().map(|a| a.id),
                },
                EmitOptions::targeting(vehicle.id).with_priority(Priority::Low),
            ));
        }

        // movement and lap bookkeeping
        let distance = vehicle.apply_physics(dt, &result, &controls);
        vehicle.racetime = now;

        if let Some(dist_after_line) = vehicle.sh.update_race_prog(distance, track) {
            let t_line = if vehicle.speed > 0.0 {
                now - dist_after_line / (vehicle.speed / 3.6)
            } else {
                now
            };
            let laptime = vehicle.sh.register_lap(t_line.max(now - dt));
            vehicle.laptimes.push(laptime);
            vehicle.tireset.drive_lap();
            log::debug!(
                "Vehicle {} completed lap {} in {:.3}s",
                vehicle.id,
                vehicle.sh.get_compl_lap(),
                laptime
            );
        }
        vehicle.sync_position(track);

        // pit entry
        if decision.pit_stop == PitIntent::NextLap {
            vehicle.sh.pit_requested = true;
        }
        let wants_pit = decision.pit_stop == PitIntent::Immediate || vehicle.sh.pit_requested;
        if wants_pit && vehicle.sh.get_cur_segment() == track.pit_entry_segment {
            vehicle.sh.enter_pit(track.pit_duration);
            vehicle.speed = 0.0;
            vehicle.acceleration = 0.0;
            emitted.push((
                EventPayload::PitStop {
                    duration: track.pit_duration,
                },
                EmitOptions::targeting(vehicle.id).with_priority(Priority::Medium),
            ));
        }

        self.check_obstacle_contact(idx);
        emitted
    }

    /// check_obstacle_contact slows a vehicle down that is on a segment carrying an obstacle.
    fn check_obstacle_contact(&mut self, idx: usize) {
        let single_use = self.race_pars.obstacle_single_use;
        let vehicle = &mut self.world.agents[idx].vehicle;
        if vehicle.is_pitting() {
            return;
        }
        let seg_idx = vehicle.sh.get_cur_segment();

        let segment = match self.world.track.segments.get_mut(seg_idx) {
            Some(segment) => segment,
            None => return,
        };
        let severity = match &segment.obstacle {
            Some(obstacle) if !obstacle.hit_by.contains(&vehicle.id) => obstacle.severity,
            _ => return,
        };

        vehicle.speed *= 1.0 - clamp_unit(severity);
        log::info!("Vehicle {} hit the obstacle on segment {}", vehicle.id, seg_idx);

        if single_use {
            segment.obstacle = None;
        } else if let Some(obstacle) = segment.obstacle.as_mut() {
            obstacle.hit_by.push(vehicle.id);
        }
    }

    /// count_position_changes compares the running order with the one before the tick. For every
    /// swapped pair the overtaker gains an overtake and the overtaken vehicle loses a position.
    fn count_position_changes(&mut self, order_before: &[usize]) {
        let order_after = self.running_order();
        let no_agents = self.world.agents.len();

        let mut pos_before = vec![0; no_agents];
        let mut pos_after = vec![0; no_agents];
        for (pos, &idx) in order_before.iter().enumerate() {
            pos_before[idx] = pos;
        }
        for (pos, &idx) in order_after.iter().enumerate() {
            pos_after[idx] = pos;
        }

        for a in 0..no_agents {
            for b in 0..no_agents {
                // a was ahead of b and is behind it now
                if pos_before[a] < pos_before[b] && pos_after[a] > pos_after[b] {
                    self.world.agents[b].vehicle.overtakes += 1;
                    self.world.agents[a].vehicle.positions_lost += 1;
                }
            }
        }
    }

    fn check_completion(&mut self) {
        if self.status == RaceStatus::Finished {
            return;
        }
        if self.world.leader_lap() >= self.tot_no_laps {
            self.status = RaceStatus::Finished;
            self.accumulator = 0.0;
            log::info!(
                "Race finished after {:.3}s ({} ticks)",
                self.world.racetime,
                self.tick_count
            );
        }
    }

    // ---------------------------------------------------------------------------------------------
    // METHODS (HELPERS) ---------------------------------------------------------------------------
    // ---------------------------------------------------------------------------------------------

    fn emit_snapshot(&mut self) {
        if self.snapshot_callback.is_none() {
            return;
        }
        let snapshot = self.snapshot();
        if let Some(callback) = self.snapshot_callback.as_mut() {
            callback(snapshot);
        }
    }

    /// snapshot returns an owned projection of the current race state.
    pub fn snapshot(&self) -> RaceSnapshot {
        let order = self.running_order();
        let mut positions = vec![0; order.len()];
        for (pos, &idx) in order.iter().enumerate() {
            positions[idx] = pos + 1;
        }

        let vehicles = self
            .world
            .agents
            .iter()
            .zip(positions)
            .map(|(agent, position)| {
                let vehicle = &agent.vehicle;
                VehicleSummary {
                    id: vehicle.id,
                    name: vehicle.name.to_owned(),
                    class: vehicle.class,
                    position,
                    compl_laps: vehicle.sh.get_compl_lap(),
                    segment: vehicle.sh.get_cur_segment(),
                    seg_progress: vehicle.sh.get_seg_progress(),
                    race_distance: vehicle.sh.race_distance(&self.world.track),
                    xy: vehicle.position,
                    heading: vehicle.heading,
                    speed: vehicle.speed,
                    energy: vehicle.energy_level(),
                    tire_wear: vehicle.tire_wear(),
                    compound: vehicle.tireset.compound,
                    pitting: vehicle.is_pitting(),
                    pit_remaining: vehicle.sh.get_t_pit_remaining(),
                    overtakes: vehicle.overtakes,
                    positions_lost: vehicle.positions_lost,
                    best_laptime: vehicle.best_laptime(),
                    last_decision: agent.last_decision().cloned(),
                }
            })
            .collect();

        RaceSnapshot {
            tick: self.tick_count,
            elapsed: self.world.racetime,
            status: self.status,
            leader_lap: self.world.leader_lap(),
            tot_no_laps: self.tot_no_laps,
            weather: self.world.weather.clone(),
            vehicles,
            pending_events: self.events.pending().iter().map(PendingEvent::from).collect(),
        }
    }

    /// race_result returns the classification and lap times at the current state of the race.
    pub fn race_result(&self) -> RaceResult {
        let order = self.running_order();

        let classification = order
            .iter()
            .enumerate()
            .map(|(pos, &idx)| {
                let agent = &self.world.agents[idx];
                let vehicle = &agent.vehicle;
                ClassificationEntry {
                    position: pos + 1,
                    vehicle_id: vehicle.id,
                    name: vehicle.name.to_owned(),
                    laps: vehicle.sh.get_compl_lap(),
                    race_distance: vehicle.sh.race_distance(&self.world.track),
                    racetime: vehicle.laptimes.iter().sum(),
                    best_laptime: vehicle.best_laptime(),
                    laptimes: vehicle.laptimes.to_owned(),
                    overtakes: vehicle.overtakes,
                    positions_lost: vehicle.positions_lost,
                    metrics: agent.metrics(),
                }
            })
            .collect();

        RaceResult {
            track_name: self.world.track.name.to_owned(),
            tot_no_laps: self.tot_no_laps,
            seed: self.seed,
            finished: self.status == RaceStatus::Finished,
            elapsed: self.world.racetime,
            classification,
            events: self.world.event_log.to_owned(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::track::tests::{segment_pars, track_pars};
    use crate::core::track::SegmentKind;
    use crate::core::vehicle::tests::vehicle_pars;
    use approx::assert_relative_eq;
    use std::sync::{Arc, Mutex};

    pub(crate) fn race_pars(tot_no_laps: u32) -> RacePars {
        RacePars {
            tot_no_laps,
            seed: Some(7),
            grid_spacing_m: 0.5,
            event_rates: EventRates::none(),
            collision_proximity_m: 3.0,
            obstacle_single_use: true,
            obstacle_ttl_s: 30.0,
            weather: Weather::default(),
            boost_multiplier: 1.03,
            overtake_multiplier: 1.02,
        }
    }

    fn oval() -> TrackPars {
        track_pars(vec![
            segment_pars(0, SegmentKind::Straight, 400.0),
            segment_pars(1, SegmentKind::Corner, 200.0),
            segment_pars(2, SegmentKind::Straight, 400.0),
            segment_pars(3, SegmentKind::Corner, 200.0),
        ])
    }

    fn race(no_vehicles: u32, tot_no_laps: u32) -> Race {
        let roster: Vec<VehiclePars> = (1..=no_vehicles).map(vehicle_pars).collect();
        Race::new(
            &race_pars(tot_no_laps),
            &oval(),
            &roster,
            &ProviderRegistry::new(),
            0.1,
        )
    }

    #[test]
    fn grid_is_staggered_by_roster_index() {
        let race = race(3, 5);
        let distances: Vec<f64> = race
            .world
            .agents
            .iter()
            .map(|a| a.vehicle.sh.race_distance(&race.world.track))
            .collect();

        assert_relative_eq!(distances[0], 0.0);
        assert_relative_eq!(distances[1], 0.5, epsilon = 1e-9);
        assert_relative_eq!(distances[2], 1.0, epsilon = 1e-9);
    }

    #[test]
    fn start_requires_vehicles_and_track() {
        let mut empty = Race::new(&race_pars(5), &oval(), &[], &ProviderRegistry::new(), 0.1);
        assert!(!empty.start());
        assert_eq!(empty.status(), RaceStatus::Stopped);

        let mut no_track = Race::new(
            &race_pars(5),
            &track_pars(Vec::new()),
            &[vehicle_pars(1)],
            &ProviderRegistry::new(),
            0.1,
        );
        assert!(!no_track.start());

        let mut race = race(1, 5);
        assert!(race.start());
        assert!(!race.start());
        assert_eq!(race.status(), RaceStatus::Running);
    }

    #[test]
    fn pause_keeps_the_accumulated_time() {
        let mut race = race(2, 5);
        race.start();
        assert_eq!(race.advance(0.35), 3);
        let t = race.cur_racetime();

        race.pause();
        assert_eq!(race.status(), RaceStatus::Paused);
        assert_eq!(race.advance(1.0), 0);
        assert_relative_eq!(race.cur_racetime(), t);

        race.resume();
        assert_eq!(race.status(), RaceStatus::Running);
        // the leftover 0.05s plus 0.05s make one more tick
        assert_eq!(race.advance(0.05), 1);
    }

    #[test]
    fn speed_multiplier_is_clamped_and_scales_ticks() {
        let mut race = race(1, 5);
        race.set_speed_multiplier(100.0);
        assert_relative_eq!(race.speed_multiplier(), MAX_SPEED_MULTIPLIER);
        race.set_speed_multiplier(0.0);
        assert_relative_eq!(race.speed_multiplier(), MIN_SPEED_MULTIPLIER);
        race.set_speed_multiplier(f64::NAN);
        assert_relative_eq!(race.speed_multiplier(), MIN_SPEED_MULTIPLIER);

        race.set_speed_multiplier(4.0);
        race.start();
        assert_eq!(race.advance(0.25), 10);
    }

    #[test]
    fn tick_frame_is_capped() {
        let mut race = race(1, 1000);
        race.start();
        race.set_speed_multiplier(10.0);
        assert_eq!(race.advance(50.0), MAX_TICKS_PER_FRAME);
        assert_eq!(race.advance(0.001), 0);
    }

    #[test]
    fn snapshots_are_delivered_every_tick() {
        let mut race = race(2, 5);
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        race.set_snapshot_callback(move |snapshot| sink.lock().unwrap().push(snapshot));

        for _ in 0..5 {
            race.tick(0.1);
        }

        let snapshots = received.lock().unwrap().clone();
        assert_eq!(snapshots.len(), 5);
        assert_eq!(snapshots[4].tick, 5);
        assert_relative_eq!(snapshots[4].elapsed, 0.5, epsilon = 1e-9);
        assert_eq!(snapshots[4].vehicles.len(), 2);
    }

    #[test]
    fn breakdown_event_slows_the_target_down() {
        let mut race = race(2, 5);
        race.world.agents[0].vehicle.speed = 100.0;
        race.events_mut().emit(
            EventPayload::Breakdown { severity: 0.5 },
            EmitOptions::targeting(1),
        );

        race.events.process(0.0, &mut race.world);

        assert_relative_eq!(race.world.agents[0].vehicle.speed, 50.0);
        assert_eq!(race.world.event_log.len(), 1);
        assert_eq!(race.world.event_log[0].kind, EventKind::Breakdown);
    }

    #[test]
    fn collision_hits_both_vehicles() {
        let mut race = race(2, 5);
        race.world.agents[0].vehicle.speed = 100.0;
        race.world.agents[1].vehicle.speed = 200.0;
        race.events_mut().emit(
            EventPayload::Collision {
                other: 2,
                severity: 0.5,
            },
            EmitOptions::targeting(1),
        );

        race.events.process(0.0, &mut race.world);

        assert_relative_eq!(race.world.agents[0].vehicle.speed, 70.0, epsilon = 1e-9);
        assert_relative_eq!(race.world.agents[1].vehicle.speed, 140.0, epsilon = 1e-9);
        assert_relative_eq!(race.world.agents[0].vehicle.tire_wear(), 0.05, epsilon = 1e-12);
    }

    #[test]
    fn events_for_unknown_vehicles_are_isolated() {
        let mut race = race(1, 5);
        race.events_mut().emit(
            EventPayload::Breakdown { severity: 0.5 },
            EmitOptions::targeting(99),
        );
        race.events.process(0.0, &mut race.world);
        assert_eq!(race.events().failed_deliveries(), 1);
    }

    #[test]
    fn single_use_obstacle_is_consumed_by_the_first_vehicle() {
        let mut race = race(2, 5);
        race.world.agents[0].vehicle.speed = 100.0;
        race.world.agents[1].vehicle.speed = 100.0;
        race.world.track.place_obstacle(
            0,
            ObstacleMarker {
                severity: 0.4,
                appeared_at: 0.0,
                expires_at: 30.0,
                hit_by: Vec::new(),
            },
        );

        race.check_obstacle_contact(0);
        race.check_obstacle_contact(1);

        assert_relative_eq!(race.world.agents[0].vehicle.speed, 60.0, epsilon = 1e-9);
        assert_relative_eq!(race.world.agents[1].vehicle.speed, 100.0);
        assert!(race.world.track.segments[0].obstacle.is_none());
    }

    #[test]
    fn shared_obstacle_hits_every_vehicle_once() {
        let mut pars = race_pars(5);
        pars.obstacle_single_use = false;
        let roster = vec![vehicle_pars(1), vehicle_pars(2)];
        let mut race = Race::new(&pars, &oval(), &roster, &ProviderRegistry::new(), 0.1);
        race.world.agents[0].vehicle.speed = 100.0;
        race.world.agents[1].vehicle.speed = 100.0;
        race.world.track.place_obstacle(
            0,
            ObstacleMarker {
                severity: 0.5,
                appeared_at: 0.0,
                expires_at: 30.0,
                hit_by: Vec::new(),
            },
        );

        race.check_obstacle_contact(0);
        race.check_obstacle_contact(0);
        race.check_obstacle_contact(1);

        assert_relative_eq!(race.world.agents[0].vehicle.speed, 50.0);
        assert_relative_eq!(race.world.agents[1].vehicle.speed, 50.0);
        assert!(race.world.track.segments[0].obstacle.is_some());
    }

    #[test]
    fn all_vehicles_decide_on_the_obstacles_from_the_start_of_the_tick() {
        let mut race = race(2, 5);
        race.world.agents[0].vehicle.speed = 290.0;
        race.world.agents[1].vehicle.speed = 290.0;
        race.world.track.place_obstacle(
            0,
            ObstacleMarker {
                severity: 0.9,
                appeared_at: 0.0,
                expires_at: 30.0,
                hit_by: Vec::new(),
            },
        );
        assert_eq!(race.decision_context(1).unwrap().hazards.len(), 1);

        assert!(race.start());
        race.tick(0.1);

        // the first vehicle consumed the marker, the second one still saw it
        assert!(race.world.track.segments[0].obstacle.is_none());
        for agent in race.world.agents.iter() {
            let decision = agent.last_decision().unwrap();
            assert_relative_eq!(decision.throttle, 0.0);
            assert!(decision.braking > 0.0);
        }
    }

    #[test]
    fn overtakes_are_counted_from_the_running_order() {
        let mut race = race(2, 5);
        let track = race.world.track.clone();
        let order_before = race.running_order();
        assert_eq!(order_before, vec![1, 0]);

        race.world.agents[0].vehicle.sh.update_race_prog(10.0, &track);
        race.count_position_changes(&order_before);

        assert_eq!(race.world.agents[0].vehicle.overtakes, 1);
        assert_eq!(race.world.agents[1].vehicle.positions_lost, 1);
    }

    #[test]
    fn immediate_pit_intent_enters_the_pits_at_the_pit_entry() {
        let single = track_pars(vec![segment_pars(0, SegmentKind::Straight, 1000.0)]);
        let mut pars = vehicle_pars(1);
        pars.energy.level = 0.01;
        let mut race = Race::new(&race_pars(5), &single, &[pars], &ProviderRegistry::new(), 0.1);

        race.tick(0.1);
        let vehicle = &race.world.agents[0].vehicle;
        assert!(vehicle.is_pitting());
        assert_eq!(vehicle.speed, 0.0);

        // 20s standstill
        for _ in 0..200 {
            race.tick(0.1);
        }
        let vehicle = &race.world.agents[0].vehicle;
        assert!(!vehicle.is_pitting());
        assert_eq!(vehicle.energy_level(), 1.0);
        assert!(race
            .world
            .event_log
            .iter()
            .any(|e| e.kind == EventKind::PitStop));
    }

    #[test]
    fn race_finishes_with_the_leader() {
        let mut race = race(2, 1);
        race.start();
        let mut no_ticks = 0;
        while race.status() == RaceStatus::Running && no_ticks < 10_000 {
            race.tick(0.1);
            no_ticks += 1;
        }

        assert_eq!(race.status(), RaceStatus::Finished);
        let result = race.race_result();
        assert!(result.finished);
        assert_eq!(result.classification[0].laps, 1);
        assert_eq!(result.classification[0].laptimes.len(), 1);

        // ticks after the finish are ignored
        let ticks = race.tick_count();
        race.tick(0.1);
        assert_eq!(race.tick_count(), ticks);
    }

    #[test]
    fn reset_restores_the_grid_and_emits_one_snapshot() {
        let mut race = race(2, 5);
        let count = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&count);
        race.set_snapshot_callback(move |_| *counter.lock().unwrap() += 1);

        race.start();
        for _ in 0..50 {
            race.tick(0.1);
        }
        race.reset();

        assert_eq!(race.status(), RaceStatus::Stopped);
        assert_eq!(race.tick_count(), 0);
        assert_eq!(race.world.agents[0].vehicle.speed, 0.0);
        assert_relative_eq!(
            race.world.agents[1].vehicle.sh.race_distance(&race.world.track),
            0.5,
            epsilon = 1e-9
        );
        assert_eq!(*count.lock().unwrap(), 51);
    }
}
