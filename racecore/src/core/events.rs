//! Typed, prioritized, time-delayed publish/subscribe bus.
//!
//! Events are queued with a delivery time and dispatched by `process` in the order (priority
//! descending, delivery time ascending, emission order ascending). Handlers receive the event,
//! mutable access to the world state `W` and an `EventSink` for follow-up events. Events emitted
//! into the sink are queued only after the current `process` call, so a handler can never cause
//! recursive dispatch.

use crate::core::weather::Weather;
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WeatherChange,
    Breakdown,
    ObstacleAppear,
    OvertakeAttempt,
    BatteryLow,
    PitStop,
    Collision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    WeatherChange { previous: Weather, current: Weather },
    Breakdown { severity: f64 },
    ObstacleAppear { segment: usize, severity: f64, ttl: f64 },
    OvertakeAttempt { attacker: u32, defender: Option<u32> },
    BatteryLow { level: f64 },
    PitStop { duration: f64 },
    Collision { other: u32, severity: f64 },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::WeatherChange { .. } => EventKind::WeatherChange,
            EventPayload::Breakdown { .. } => EventKind::Breakdown,
            EventPayload::ObstacleAppear { .. } => EventKind::ObstacleAppear,
            EventPayload::OvertakeAttempt { .. } => EventKind::OvertakeAttempt,
            EventPayload::BatteryLow { .. } => EventKind::BatteryLow,
            EventPayload::PitStop { .. } => EventKind::PitStop,
            EventPayload::Collision { .. } => EventKind::Collision,
        }
    }
}

/// * `id` - Unique, increasing event id (also the emission order)
/// * `kind` - Event type used for subscriptions
/// * `timestamp` - (s) Logical race time at which the event is due
/// * `payload` - Event data
/// * `target` - Vehicle the event refers to, if any
/// * `priority` - Dispatch priority
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimEvent {
    pub id: u64,
    pub kind: EventKind,
    pub timestamp: f64,
    pub payload: EventPayload,
    pub target: Option<u32>,
    pub priority: Priority,
}

/// Options for emitting an event.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EmitOptions {
    pub target: Option<u32>,
    pub priority: Priority,
    pub delay: f64,
}

impl EmitOptions {
    pub fn targeting(vehicle_id: u32) -> Self {
        EmitOptions {
            target: Some(vehicle_id),
            ..EmitOptions::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: f64) -> Self {
        self.delay = delay.max(0.0);
        self
    }
}

/// Collects events emitted by handlers while the bus is dispatching.
#[derive(Debug, Default)]
pub struct EventSink {
    emitted: Vec<(EventPayload, EmitOptions)>,
}

impl EventSink {
    pub fn emit(&mut self, payload: EventPayload, opts: EmitOptions) {
        self.emitted.push((payload, opts));
    }
}

pub type Handler<W> = Box<dyn FnMut(&SimEvent, &mut W, &mut EventSink) -> anyhow::Result<()> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription<W> {
    id: SubscriptionId,
    kind: EventKind,
    handler: Handler<W>,
}

pub struct EventBus<W> {
    queue: Vec<SimEvent>,
    subscriptions: Vec<Subscription<W>>,
    now: f64,
    next_event_id: u64,
    next_subscription_id: u64,
    delivered: u64,
    failed_deliveries: u64,
}

impl<W> fmt::Debug for EventBus<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("queue", &self.queue)
            .field("subscriptions", &self.subscriptions.len())
            .field("now", &self.now)
            .field("delivered", &self.delivered)
            .field("failed_deliveries", &self.failed_deliveries)
            .finish()
    }
}

impl<W> Default for EventBus<W> {
    fn default() -> Self {
        Self::new()
    }
}

/// dispatch_order sorts by priority (descending), delivery time and emission order (ascending).
fn dispatch_order(a: &SimEvent, b: &SimEvent) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.timestamp.partial_cmp(&b.timestamp).unwrap_or(Ordering::Equal))
        .then_with(|| a.id.cmp(&b.id))
}

impl<W> EventBus<W> {
    pub fn new() -> Self {
        EventBus {
            queue: Vec::new(),
            subscriptions: Vec::new(),
            now: 0.0,
            next_event_id: 0,
            next_subscription_id: 0,
            delivered: 0,
            failed_deliveries: 0,
        }
    }

    /// subscribe registers a handler for all events of the given kind.
    pub fn subscribe<F>(&mut self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: FnMut(&SimEvent, &mut W, &mut EventSink) -> anyhow::Result<()> + Send + 'static,
    {
        let id = SubscriptionId(self.next_subscription_id);
        self.next_subscription_id += 1;
        self.subscriptions.push(Subscription {
            id,
            kind,
            handler: Box::new(handler),
        });
        id
    }

    /// unsubscribe removes a handler. Returns false if the subscription did not exist.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let len_before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.id != id);
        self.subscriptions.len() != len_before
    }

    /// emit queues an event for delivery at the current bus time plus the delay. Returns the id of
    /// the new event.
    pub fn emit(&mut self, payload: EventPayload, opts: EmitOptions) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;

        let event = SimEvent {
            id,
            kind: payload.kind(),
            timestamp: self.now + opts.delay.max(0.0),
            payload,
            target: opts.target,
            priority: opts.priority,
        };

        let pos = self
            .queue
            .partition_point(|queued| dispatch_order(queued, &event) == Ordering::Less);
        self.queue.insert(pos, event);
        id
    }

    /// process advances the bus time and dispatches all due events to their subscribers. Handler
    /// failures are logged and do not stop the dispatch; every due event is removed from the
    /// queue. Returns the number of dispatched events.
    pub fn process(&mut self, now: f64, world: &mut W) -> usize {
        self.now = now;

        let (due, pending): (Vec<SimEvent>, Vec<SimEvent>) = std::mem::take(&mut self.queue)
            .into_iter()
            .partition(|event| event.timestamp <= now + 1e-9);
        self.queue = pending;

        let mut sink = EventSink::default();

        for event in due.iter() {
            for subscription in self
                .subscriptions
                .iter_mut()
                .filter(|s| s.kind == event.kind)
            {
                match (subscription.handler)(event, world, &mut sink) {
                    Ok(()) => self.delivered += 1,
                    Err(e) => {
                        self.failed_deliveries += 1;
                        log::warn!(
                            "Handler {:?} failed on event {} ({:?}): {:#}",
                            subscription.id,
                            event.id,
                            event.kind,
                            e
                        );
                    }
                }
            }
        }

        for (payload, opts) in sink.emitted {
            self.emit(payload, opts);
        }

        due.len()
    }

    /// pending returns the queued events in dispatch order.
    pub fn pending(&self) -> &[SimEvent] {
        &self.queue
    }

    pub fn now(&self) -> f64 {
        self.now
    }

    pub fn failed_deliveries(&self) -> u64 {
        self.failed_deliveries
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// clear drops all queued events, rewinds the bus time and restarts the event numbering and
    /// delivery counters. Subscriptions are kept.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.now = 0.0;
        self.next_event_id = 0;
        self.delivered = 0;
        self.failed_deliveries = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Log {
        seen: Vec<(u64, EventKind)>,
    }

    fn record(event: &SimEvent, log: &mut Log, _sink: &mut EventSink) -> anyhow::Result<()> {
        log.seen.push((event.id, event.kind));
        Ok(())
    }

    fn breakdown() -> EventPayload {
        EventPayload::Breakdown { severity: 0.5 }
    }

    #[test]
    fn dispatches_by_priority_then_time() {
        let mut bus: EventBus<Log> = EventBus::new();
        let mut log = Log::default();
        bus.subscribe(EventKind::Breakdown, record);
        bus.subscribe(EventKind::BatteryLow, record);

        let low = bus.emit(breakdown(), EmitOptions::default().with_priority(Priority::Low));
        let late = bus.emit(breakdown(), EmitOptions::default().with_delay(0.5));
        let early = bus.emit(EventPayload::BatteryLow { level: 0.1 }, EmitOptions::default());
        let critical = bus.emit(
            breakdown(),
            EmitOptions::default().with_priority(Priority::Critical).with_delay(0.2),
        );

        assert_eq!(bus.process(1.0, &mut log), 4);
        let order: Vec<u64> = log.seen.iter().map(|(id, _)| *id).collect();
        assert_eq!(order, vec![critical, early, late, low]);
        assert!(bus.pending().is_empty());
    }

    #[test]
    fn delayed_events_wait_for_their_time() {
        let mut bus: EventBus<Log> = EventBus::new();
        let mut log = Log::default();
        bus.subscribe(EventKind::Breakdown, record);

        bus.emit(breakdown(), EmitOptions::targeting(3).with_delay(2.0));
        assert_eq!(bus.process(1.0, &mut log), 0);
        assert_eq!(bus.pending().len(), 1);
        assert_eq!(bus.pending()[0].target, Some(3));
        assert_eq!(bus.pending()[0].timestamp, 2.0);

        assert_eq!(bus.process(2.0, &mut log), 1);
        assert_eq!(log.seen.len(), 1);
    }

    #[test]
    fn failing_handler_does_not_block_others() {
        let mut bus: EventBus<Log> = EventBus::new();
        let mut log = Log::default();
        bus.subscribe(EventKind::Breakdown, |_, _: &mut Log, _| anyhow::bail!("boom"));
        bus.subscribe(EventKind::Breakdown, record);

        bus.emit(breakdown(), EmitOptions::default());
        bus.emit(breakdown(), EmitOptions::default());

        assert_eq!(bus.process(0.0, &mut log), 2);
        assert_eq!(log.seen.len(), 2);
        assert_eq!(bus.failed_deliveries(), 2);
        assert!(bus.pending().is_empty());
    }

    #[test]
    fn events_emitted_during_dispatch_are_deferred() {
        let mut bus: EventBus<Log> = EventBus::new();
        let mut log = Log::default();
        bus.subscribe(EventKind::Collision, |event, log: &mut Log, sink| {
            log.seen.push((event.id, event.kind));
            sink.emit(breakdown(), EmitOptions::default());
            Ok(())
        });
        bus.subscribe(EventKind::Breakdown, record);

        bus.emit(
            EventPayload::Collision {
                other: 2,
                severity: 0.2,
            },
            EmitOptions::targeting(1),
        );

        assert_eq!(bus.process(0.0, &mut log), 1);
        assert_eq!(log.seen.len(), 1);
        assert_eq!(bus.pending().len(), 1);

        assert_eq!(bus.process(0.0, &mut log), 1);
        assert_eq!(log.seen[1].1, EventKind::Breakdown);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let mut bus: EventBus<Log> = EventBus::new();
        let mut log = Log::default();
        let id = bus.subscribe(EventKind::Breakdown, record);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));

        bus.emit(breakdown(), EmitOptions::default());
        assert_eq!(bus.process(0.0, &mut log), 1);
        assert!(log.seen.is_empty());
    }
}
