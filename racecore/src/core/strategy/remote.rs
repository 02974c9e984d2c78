//! Remote-backed decision policy. Requests are sent to a `DecisionProvider` with a per-request
//! timeout; every failure (timeout, disconnect, malformed payload) falls back to the local
//! heuristic so that a decision is always available.

use crate::core::strategy::heuristic::HeuristicPolicy;
use crate::core::strategy::{
    DecisionContext, EnergyMode, OvertakeIntent, PitIntent, PolicyError, StrategyDecision,
    SurroundingVehicle, SAFE_RISK_LEVEL, SAFE_THROTTLE,
};
use crate::core::track::SegmentKind;
use crate::core::weather::Weather;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("decision provider did not answer within {0:?}")]
    Timeout(Duration),
    #[error("decision provider disconnected")]
    Disconnected,
    #[error("decision provider failed: {0}")]
    Failed(String),
    #[error("malformed decision payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestSegment {
    pub id: u32,
    pub kind: SegmentKind,
    pub length: f64,
    pub grip: f64,
    pub hazard_level: f64,
    pub progress: f64,
}

/// Serialized decision context sent to a provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionRequest {
    pub vehicle_id: u32,
    pub speed: f64,
    pub max_speed: f64,
    pub energy: f64,
    pub tire_wear: f64,
    pub position: [f64; 2],
    pub ahead: Vec<SurroundingVehicle>,
    pub behind: Vec<SurroundingVehicle>,
    pub segment: RequestSegment,
    pub weather: Weather,
    pub lap: u32,
    pub total_laps: u32,
    pub elapsed: f64,
}

impl DecisionRequest {
    pub fn from_context(ctx: &DecisionContext) -> DecisionRequest {
        DecisionRequest {
            vehicle_id: ctx.vehicle.id,
            speed: ctx.vehicle.speed,
            max_speed: ctx.vehicle.max_speed,
            energy: ctx.vehicle.energy_level(),
            tire_wear: ctx.vehicle.tire_wear(),
            position: ctx.vehicle.position,
            ahead: ctx.surroundings.ahead.clone(),
            behind: ctx.surroundings.behind.clone(),
            segment: RequestSegment {
                id: ctx.segment.id,
                kind: ctx.segment.kind,
                length: ctx.segment.length,
                grip: ctx.segment.grip,
                hazard_level: ctx.segment.hazard_level,
                progress: ctx.vehicle.sh.get_seg_progress(),
            },
            weather: ctx.weather.clone(),
            lap: ctx.progress.current_lap,
            total_laps: ctx.progress.total_laps,
            elapsed: ctx.progress.elapsed,
        }
    }
}

/// Source of remote decisions. A request must return within `timeout`, otherwise it fails with
/// `ProviderError::Timeout`.
pub trait DecisionProvider: Send + Sync {
    fn name(&self) -> &str;

    fn request(&self, request: &DecisionRequest, timeout: Duration) -> Result<Value, ProviderError>;
}

type Tagged<T> = (u64, T);

/// A queued request with the instant after which nobody waits for its answer any more.
type Queued = (u64, Instant, DecisionRequest);

/// ChannelProvider runs a responder function on a worker thread and talks to it via flume
/// channels. Responses are tagged with the sequence number of their request; late answers to
/// requests that already timed out are discarded. Requests whose deadline passed while they were
/// queued are skipped by the worker, so a slow responder never builds up a backlog.
pub struct ChannelProvider {
    name: String,
    tx: flume::Sender<Queued>,
    rx: flume::Receiver<Tagged<Result<Value, String>>>,
    next_seq: AtomicU64,
}

impl ChannelProvider {
    pub fn spawn<F>(name: &str, mut responder: F) -> anyhow::Result<ChannelProvider>
    where
        F: FnMut(&DecisionRequest) -> Result<Value, String> + Send + 'static,
    {
        let (req_tx, req_rx) = flume::unbounded::<Queued>();
        let (resp_tx, resp_rx) = flume::unbounded();
        let worker_name = name.to_owned();

        thread::Builder::new()
            .name(format!("provider-{}", name))
            .spawn(move || {
                for (seq, deadline, request) in req_rx.iter() {
                    if Instant::now() >= deadline {
                        log::trace!("{}: skipping expired request {}", worker_name, seq);
                        continue;
                    }
                    let response = responder(&request);
                    if resp_tx.send((seq, response)).is_err() {
                        break;
                    }
                }
            })?;

        Ok(ChannelProvider {
            name: name.to_owned(),
            tx: req_tx,
            rx: resp_rx,
            next_seq: AtomicU64::new(0),
        })
    }

    /// queued_requests returns the number of requests the worker has not picked up yet.
    pub fn queued_requests(&self) -> usize {
        self.tx.len()
    }
}

impl DecisionProvider for ChannelProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn request(&self, request: &DecisionRequest, timeout: Duration) -> Result<Value, ProviderError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + timeout;
        self.tx
            .send((seq, deadline, request.clone()))
            .map_err(|_| ProviderError::Disconnected)?;

        loop {
            match self.rx.recv_deadline(deadline) {
                Ok((resp_seq, response)) if resp_seq == seq => {
                    return response.map_err(ProviderError::Failed)
                }
                Ok((resp_seq, _)) => {
                    log::trace!("{}: discarding stale response {}", self.name, resp_seq);
                }
                Err(flume::RecvTimeoutError::Timeout) => return Err(ProviderError::Timeout(timeout)),
                Err(flume::RecvTimeoutError::Disconnected) => {
                    return Err(ProviderError::Disconnected)
                }
            }
        }
    }
}

impl fmt::Debug for ChannelProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelProvider")
            .field("name", &self.name)
            .field("next_seq", &self.next_seq.load(Ordering::Relaxed))
            .field("queued_requests", &self.queued_requests())
            .finish()
    }
}

/// Named decision providers available to the vehicles of a race.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn DecisionProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn DecisionProvider>) {
        self.providers.insert(provider.name().to_owned(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DecisionProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.providers.keys().collect();
        names.sort();
        f.debug_struct("ProviderRegistry").field("providers", &names).finish()
    }
}

/// field looks up the first of the given keys present in a JSON object.
fn field<'a>(obj: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| obj.get(*key))
}

/// decode_payload turns a provider response into a decision. Missing fields, fields of the wrong
/// type and unknown enum labels take their safe default; only a non-object payload is rejected.
/// Numeric fields are passed on unclamped.
pub fn decode_payload(payload: &Value) -> Result<StrategyDecision, ProviderError> {
    let obj = payload
        .as_object()
        .ok_or_else(|| ProviderError::Malformed(format!("expected an object, got {}", payload)))?;

    let number = |keys: &[&str], default: f64| field(obj, keys).and_then(Value::as_f64).unwrap_or(default);
    let label = |keys: &[&str]| field(obj, keys).and_then(Value::as_str);

    Ok(StrategyDecision {
        throttle: number(&["throttle"], SAFE_THROTTLE),
        braking: number(&["braking", "brake"], 0.0),
        steering: number(&["steering"], 0.0),
        risk_level: number(&["risk_level", "riskLevel"], SAFE_RISK_LEVEL),
        overtaking: label(&["overtaking", "overtake"])
            .and_then(OvertakeIntent::parse_label)
            .unwrap_or(OvertakeIntent::None),
        pit_stop: label(&["pit_stop", "pitStop"])
            .and_then(PitIntent::parse_label)
            .unwrap_or(PitIntent::None),
        boost: field(obj, &["boost", "drs"])
            .and_then(Value::as_bool)
            .unwrap_or(false),
        energy_mode: label(&["energy_mode", "energyMode", "energy_management"])
            .and_then(EnergyMode::parse_label)
            .unwrap_or(EnergyMode::Balanced),
    })
}

/// Policy backed by a remote provider with the heuristic as fallback.
pub struct RemotePolicy {
    provider: Arc<dyn DecisionProvider>,
    fallback: HeuristicPolicy,
    timeout: Duration,
    remote_decisions: u64,
    fallback_decisions: u64,
}

impl RemotePolicy {
    pub fn new(provider: Arc<dyn DecisionProvider>, timeout: Duration) -> RemotePolicy {
        RemotePolicy {
            provider,
            fallback: HeuristicPolicy::default(),
            timeout,
            remote_decisions: 0,
            fallback_decisions: 0,
        }
    }

    pub fn decide(&mut self, ctx: &DecisionContext) -> Result<StrategyDecision, PolicyError> {
        let request = DecisionRequest::from_context(ctx);

        let response = self
            .provider
            .request(&request, self.timeout)
            .and_then(|payload| decode_payload(&payload));

        match response {
            Ok(decision) => {
                self.remote_decisions += 1;
                Ok(decision)
            }
            Err(e) => {
                self.fallback_decisions += 1;
                log::debug!(
                    "vehicle {}: {} unavailable ({}), using heuristic",
                    ctx.vehicle.id,
                    self.provider.name(),
                    e
                );
                self.fallback.decide(ctx)
            }
        }
    }

    pub fn remote_decisions(&self) -> u64 {
        self.remote_decisions
    }

    pub fn fallback_decisions(&self) -> u64 {
        self.fallback_decisions
    }
}

impl fmt::Debug for RemotePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemotePolicy")
            .field("provider", &self.provider.name())
            .field("timeout", &self.timeout)
            .field("remote_decisions", &self.remote_decisions)
            .field("fallback_decisions", &self.fallback_decisions)
            .finish()
    }
}
