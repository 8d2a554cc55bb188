//! The subscribable object model: named status objects projected from
//! printer and job state, with per-subscriber change tracking so each
//! websocket only hears about keys that actually changed.

use std::collections::HashMap;

use common::status::{HeaterReading, JobState, JobStatus, PrinterState};
use serde_json::{json, Map, Value};
use tokio::{
    select, spawn,
    sync::{mpsc, oneshot, watch},
};
use tracing::debug;

use crate::printer::PrinterSnapshot;

/// Everything object values are computed from. Refreshed from the
/// printer and job watch channels before every diff pass.
#[derive(Debug, Clone)]
pub struct StatusSources {
    pub printer: PrinterSnapshot,
    pub job: JobStatus,
}

pub trait PrinterObject: Send {
    fn name(&self) -> &str;
    /// Objects report by default; ones whose values only exist while
    /// the firmware link is up override this to withhold themselves.
    fn is_available(&self, _sources: &StatusSources) -> bool {
        true
    }
    fn value(&self, sources: &StatusSources) -> Map<String, Value>;
}

fn ready(sources: &StatusSources) -> bool {
    sources.printer.state == PrinterState::Ready
}

struct Webhooks;
impl PrinterObject for Webhooks {
    fn name(&self) -> &str {
        "webhooks"
    }
    fn value(&self, sources: &StatusSources) -> Map<String, Value> {
        object(vec![
            ("state", json!(sources.printer.state)),
            ("state_message", json!(sources.printer.state_message)),
        ])
    }
}

struct Toolhead;
impl PrinterObject for Toolhead {
    fn name(&self) -> &str {
        "toolhead"
    }
    fn is_available(&self, sources: &StatusSources) -> bool {
        ready(sources)
    }
    fn value(&self, sources: &StatusSources) -> Map<String, Value> {
        let motion = &sources.printer.motion;
        object(vec![
            ("position", json!(motion.position)),
            ("homed_axes", json!(motion.homed_axes())),
        ])
    }
}

struct GcodeMove;
impl PrinterObject for GcodeMove {
    fn name(&self) -> &str {
        "gcode_move"
    }
    fn is_available(&self, sources: &StatusSources) -> bool {
        ready(sources)
    }
    fn value(&self, sources: &StatusSources) -> Map<String, Value> {
        let motion = &sources.printer.motion;
        object(vec![
            ("gcode_position", json!(motion.position)),
            ("absolute_coordinates", json!(motion.absolute_xyz)),
            ("absolute_extrude", json!(motion.absolute_e)),
            // Marlin feedrates are mm/min; clients expect mm/s.
            ("speed", json!(motion.feedrate / 60.0)),
            ("speed_factor", json!(motion.speed_factor)),
            ("extrude_factor", json!(motion.extrude_factor)),
        ])
    }
}

/// A heater or passive sensor backed by one of the firmware's runtime
/// -discovered temperature keys.
struct Heater {
    object_name: String,
    keys: Vec<String>,
    has_target: bool,
}

impl PrinterObject for Heater {
    fn name(&self) -> &str {
        &self.object_name
    }
    fn is_available(&self, sources: &StatusSources) -> bool {
        ready(sources)
            && sources
                .printer
                .heaters
                .iter()
                .any(|(key, _)| self.keys.iter().any(|own| own == key))
    }
    fn value(&self, sources: &StatusSources) -> Map<String, Value> {
        let reading = sources
            .printer
            .heaters
            .iter()
            .find(|(key, _)| self.keys.iter().any(|own| own == key))
            .map(|(_, reading)| reading.clone())
            .unwrap_or(HeaterReading {
                temperature: 0.0,
                target: 0.0,
                power: 0.0,
            });
        let mut fields = vec![("temperature", json!(reading.temperature))];
        if self.has_target {
            fields.push(("target", json!(reading.target)));
            fields.push(("power", json!(reading.power)));
        }
        object(fields)
    }
}

struct Fan;
impl PrinterObject for Fan {
    fn name(&self) -> &str {
        "fan"
    }
    fn is_available(&self, sources: &StatusSources) -> bool {
        ready(sources)
    }
    fn value(&self, sources: &StatusSources) -> Map<String, Value> {
        object(vec![("speed", json!(sources.printer.motion.fan_speed))])
    }
}

struct PrintStats;
impl PrinterObject for PrintStats {
    fn name(&self) -> &str {
        "print_stats"
    }
    fn value(&self, sources: &StatusSources) -> Map<String, Value> {
        object(vec![
            ("state", json!(sources.job.state)),
            ("filename", json!(sources.job.filename)),
            ("message", json!(sources.job.message)),
        ])
    }
}

struct VirtualSdcard;
impl PrinterObject for VirtualSdcard {
    fn name(&self) -> &str {
        "virtual_sdcard"
    }
    fn value(&self, sources: &StatusSources) -> Map<String, Value> {
        object(vec![
            ("is_active", json!(sources.job.state == JobState::Printing)),
            ("progress", json!(sources.job.progress)),
            ("file_position", json!(sources.job.file_position)),
            ("file_size", json!(sources.job.file_size)),
        ])
    }
}

struct MotionReport;
impl PrinterObject for MotionReport {
    fn name(&self) -> &str {
        "motion_report"
    }
    fn is_available(&self, sources: &StatusSources) -> bool {
        ready(sources)
    }
    fn value(&self, sources: &StatusSources) -> Map<String, Value> {
        object(vec![("live_position", json!(sources.printer.motion.position))])
    }
}

fn object(fields: Vec<(&str, Value)>) -> Map<String, Value> {
    fields
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect()
}

/// Sensor keys beyond the hotend and bed get friendly Klipper-style
/// object names where the convention is known.
fn sensor_object_name(key: &str) -> String {
    let suffix = match key {
        "C" => "chamber".to_string(),
        "P" => "probe".to_string(),
        "A" => "ambient".to_string(),
        "R" => "redundant".to_string(),
        other => other.to_lowercase(),
    };
    format!("temperature_sensor {suffix}")
}

struct Subscription {
    object: String,
    topics: Option<Vec<String>>,
    last: Map<String, Value>,
}

struct Subscriber {
    id: usize,
    subscriptions: Vec<Subscription>,
}

/// Registry plus subscription bookkeeping. Purely synchronous; the task
/// wrapper below owns the channels.
pub struct ObjectModel {
    objects: Vec<Box<dyn PrinterObject>>,
    subscribers: Vec<Subscriber>,
}

impl ObjectModel {
    pub fn new() -> Self {
        ObjectModel {
            objects: vec![
                Box::new(Webhooks),
                Box::new(Toolhead),
                Box::new(GcodeMove),
                Box::new(Heater {
                    object_name: "extruder".to_string(),
                    keys: vec!["T".to_string(), "T0".to_string()],
                    has_target: true,
                }),
                Box::new(Heater {
                    object_name: "heater_bed".to_string(),
                    keys: vec!["B".to_string()],
                    has_target: true,
                }),
                Box::new(Fan),
                Box::new(PrintStats),
                Box::new(VirtualSdcard),
                Box::new(MotionReport),
            ],
            subscribers: Vec::new(),
        }
    }

    fn find(&self, name: &str) -> Option<&dyn PrinterObject> {
        self.objects
            .iter()
            .find(|object| object.name() == name)
            .map(|object| object.as_ref())
    }

    /// Register objects for heater keys seen for the first time, so a
    /// chamber sensor or second hotend becomes subscribable the moment
    /// the firmware starts reporting it.
    fn discover(&mut self, sources: &StatusSources) {
        let new_objects: Vec<Heater> = sources
            .printer
            .heaters
            .iter()
            .filter_map(|(key, _)| match key.as_str() {
                "T" | "T0" | "B" => None,
                other => {
                    let (object_name, has_target) = match other
                        .strip_prefix('T')
                        .and_then(|n| n.parse::<u32>().ok())
                    {
                        Some(n) => (format!("extruder{n}"), true),
                        None => (sensor_object_name(other), false),
                    };
                    if self.find(&object_name).is_some() {
                        None
                    } else {
                        Some(Heater {
                            object_name,
                            keys: vec![other.to_string()],
                            has_target,
                        })
                    }
                }
            })
            .collect();
        for heater in new_objects {
            debug!(object = %heater.object_name, "discovered temperature object");
            self.objects.push(Box::new(heater));
        }
    }

    fn filtered_value(
        object: &dyn PrinterObject,
        sources: &StatusSources,
        topics: &Option<Vec<String>>,
    ) -> Map<String, Value> {
        let mut value = object.value(sources);
        if let Some(topics) = topics {
            value.retain(|key, _| topics.iter().any(|topic| topic == key));
        }
        value
    }

    /// One-shot status query. Unknown and unavailable objects are
    /// silently skipped.
    pub fn query(
        &mut self,
        sources: &StatusSources,
        requests: &[(String, Option<Vec<String>>)],
    ) -> Map<String, Value> {
        self.discover(sources);
        let mut status = Map::new();
        for (name, topics) in requests {
            let object = match self.find(name) {
                Some(object) => object,
                None => continue,
            };
            if !object.is_available(sources) {
                continue;
            }
            status.insert(
                name.clone(),
                Value::Object(Self::filtered_value(object, sources, topics)),
            );
        }
        status
    }

    /// Install subscriptions for one subscriber, replacing anything that
    /// subscriber had before, and return the initial full snapshot.
    pub fn subscribe(
        &mut self,
        subscriber: usize,
        requests: Vec<(String, Option<Vec<String>>)>,
        sources: &StatusSources,
    ) -> Map<String, Value> {
        self.discover(sources);
        self.subscribers.retain(|existing| existing.id != subscriber);
        let mut subscriptions = Vec::new();
        let mut status = Map::new();
        for (name, topics) in requests {
            let object = match self.find(&name) {
                Some(object) => object,
                None => continue,
            };
            // Unavailable objects are withheld from the snapshot, not
            // reported empty. The subscription still starts with an
            // empty remembered value so the first diff after the object
            // comes up carries its full value.
            let last = if object.is_available(sources) {
                let value = Self::filtered_value(object, sources, &topics);
                status.insert(name.clone(), Value::Object(value.clone()));
                value
            } else {
                Map::new()
            };
            subscriptions.push(Subscription {
                object: name,
                topics,
                last,
            });
        }
        self.subscribers.push(Subscriber {
            id: subscriber,
            subscriptions,
        });
        status
    }

    pub fn unsubscribe(&mut self, subscriber: usize) {
        self.subscribers.retain(|existing| existing.id != subscriber);
    }

    /// Recompute every subscribed object and return, per subscriber, the
    /// keys whose values differ from what that subscriber last saw. A
    /// subscription's remembered value only advances when its diff is
    /// non-empty, so an unchanged value can never produce a second
    /// notification.
    pub fn update(&mut self, sources: &StatusSources) -> Vec<(usize, Map<String, Value>)> {
        self.discover(sources);
        let objects = &self.objects;
        let mut notifications = Vec::new();
        for subscriber in &mut self.subscribers {
            let mut changed = Map::new();
            for subscription in &mut subscriber.subscriptions {
                let object = match objects
                    .iter()
                    .find(|object| object.name() == subscription.object)
                {
                    Some(object) => object.as_ref(),
                    None => continue,
                };
                if !object.is_available(sources) {
                    continue;
                }
                let next = Self::filtered_value(object, sources, &subscription.topics);
                let delta: Map<String, Value> = next
                    .iter()
                    .filter(|(key, value)| subscription.last.get(*key) != Some(value))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect();
                if !delta.is_empty() {
                    subscription.last = next;
                    changed.insert(subscription.object.clone(), Value::Object(delta));
                }
            }
            if !changed.is_empty() {
                notifications.push((subscriber.id, changed));
            }
        }
        notifications
    }
}

pub enum ModelRequest {
    Subscribe {
        subscriber: usize,
        requests: Vec<(String, Option<Vec<String>>)>,
        sink: mpsc::Sender<Map<String, Value>>,
        responder: oneshot::Sender<Map<String, Value>>,
    },
    Query {
        requests: Vec<(String, Option<Vec<String>>)>,
        responder: oneshot::Sender<Map<String, Value>>,
    },
    Unsubscribe {
        subscriber: usize,
    },
}

#[derive(Clone)]
pub struct ObjectModelHandle {
    requests: mpsc::Sender<ModelRequest>,
}

impl ObjectModelHandle {
    pub async fn subscribe(
        &self,
        subscriber: usize,
        requests: Vec<(String, Option<Vec<String>>)>,
        sink: mpsc::Sender<Map<String, Value>>,
    ) -> Option<Map<String, Value>> {
        let (responder, receiver) = oneshot::channel();
        self.requests
            .send(ModelRequest::Subscribe {
                subscriber,
                requests,
                sink,
                responder,
            })
            .await
            .ok()?;
        receiver.await.ok()
    }

    pub async fn query(
        &self,
        requests: Vec<(String, Option<Vec<String>>)>,
    ) -> Option<Map<String, Value>> {
        let (responder, receiver) = oneshot::channel();
        self.requests
            .send(ModelRequest::Query {
                requests,
                responder,
            })
            .await
            .ok()?;
        receiver.await.ok()
    }

    pub async fn unsubscribe(&self, subscriber: usize) {
        drop(
            self.requests
                .send(ModelRequest::Unsubscribe { subscriber })
                .await,
        );
    }
}

/// Spawn the single task that owns the model. All invalidation flows in
/// through the two watch channels; all client traffic through the
/// request channel. No locks anywhere.
pub fn start_object_model(
    mut printer: watch::Receiver<PrinterSnapshot>,
    mut job: watch::Receiver<JobStatus>,
) -> ObjectModelHandle {
    let (requests, mut requests_rx) = mpsc::channel::<ModelRequest>(32);
    spawn(async move {
        let mut model = ObjectModel::new();
        let mut sinks: HashMap<usize, mpsc::Sender<Map<String, Value>>> = HashMap::new();
        let mut sources = StatusSources {
            printer: printer.borrow().clone(),
            job: job.borrow().clone(),
        };
        loop {
            select! {
                changed = printer.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    sources.printer = printer.borrow_and_update().clone();
                    deliver(&mut model, &sources, &mut sinks);
                }
                changed = job.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    sources.job = job.borrow_and_update().clone();
                    deliver(&mut model, &sources, &mut sinks);
                }
                request = requests_rx.recv() => match request {
                    None => break,
                    Some(ModelRequest::Subscribe { subscriber, requests, sink, responder }) => {
                        let status = model.subscribe(subscriber, requests, &sources);
                        sinks.insert(subscriber, sink);
                        drop(responder.send(status));
                    }
                    Some(ModelRequest::Query { requests, responder }) => {
                        drop(responder.send(model.query(&sources, &requests)));
                    }
                    Some(ModelRequest::Unsubscribe { subscriber }) => {
                        model.unsubscribe(subscriber);
                        sinks.remove(&subscriber);
                    }
                },
            }
        }
    });
    ObjectModelHandle { requests }
}

fn deliver(
    model: &mut ObjectModel,
    sources: &StatusSources,
    sinks: &mut HashMap<usize, mpsc::Sender<Map<String, Value>>>,
) {
    for (subscriber, status) in model.update(sources) {
        let gone = match sinks.get(&subscriber) {
            // A slow client loses intermediate diffs, not its socket.
            Some(sink) => sink.try_send(status).is_err() && sink.is_closed(),
            None => true,
        };
        if gone {
            model.unsubscribe(subscriber);
            sinks.remove(&subscriber);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::status::HeaterReading;

    fn sources() -> StatusSources {
        let mut printer = PrinterSnapshot::startup();
        printer.state = PrinterState::Ready;
        printer.heaters = vec![
            (
                "T".to_string(),
                HeaterReading {
                    temperature: 210.0,
                    target: 215.0,
                    power: 0.5,
                },
            ),
            (
                "B".to_string(),
                HeaterReading {
                    temperature: 60.0,
                    target: 60.0,
                    power: 1.0,
                },
            ),
        ];
        StatusSources {
            printer,
            job: JobStatus::default(),
        }
    }

    fn all_of(name: &str) -> (String, Option<Vec<String>>) {
        (name.to_string(), None)
    }

    fn topics(name: &str, list: &[&str]) -> (String, Option<Vec<String>>) {
        (
            name.to_string(),
            Some(list.iter().map(|t| t.to_string()).collect()),
        )
    }

    #[test]
    fn test_query_skips_unknown_objects() {
        let mut model = ObjectModel::new();
        let status = model.query(&sources(), &[all_of("extruder"), all_of("gcode_macro")]);
        assert!(status.contains_key("extruder"));
        assert!(!status.contains_key("gcode_macro"));
        assert_eq!(status["extruder"]["temperature"], json!(210.0));
    }

    #[test]
    fn test_unchanged_state_produces_no_diff() {
        let mut model = ObjectModel::new();
        let sources = sources();
        model.subscribe(1, vec![all_of("extruder"), all_of("toolhead")], &sources);
        assert!(model.update(&sources).is_empty());
    }

    #[test]
    fn test_diff_contains_only_changed_keys() {
        let mut model = ObjectModel::new();
        let mut sources = sources();
        model.subscribe(1, vec![all_of("extruder")], &sources);
        sources.printer.heaters[0].1.temperature = 211.5;
        let notifications = model.update(&sources);
        assert_eq!(notifications.len(), 1);
        let (subscriber, status) = &notifications[0];
        assert_eq!(*subscriber, 1);
        let extruder = status["extruder"].as_object().unwrap();
        assert_eq!(extruder.len(), 1);
        assert_eq!(extruder["temperature"], json!(211.5));
        // Identical state immediately afterwards is silent.
        assert!(model.update(&sources).is_empty());
    }

    #[test]
    fn test_topic_filter_restricts_keys() {
        let mut model = ObjectModel::new();
        let mut sources = sources();
        model.subscribe(1, vec![topics("extruder", &["target"])], &sources);
        sources.printer.heaters[0].1.temperature = 250.0;
        // Temperature is not subscribed, so nothing changes.
        assert!(model.update(&sources).is_empty());
        sources.printer.heaters[0].1.target = 240.0;
        let notifications = model.update(&sources);
        assert_eq!(notifications[0].1["extruder"]["target"], json!(240.0));
    }

    #[test]
    fn test_resubscribe_replaces_prior_subscriptions() {
        let mut model = ObjectModel::new();
        let mut sources = sources();
        model.subscribe(1, vec![all_of("extruder")], &sources);
        model.subscribe(1, vec![all_of("heater_bed")], &sources);
        sources.printer.heaters[0].1.temperature = 300.0;
        // The extruder subscription is gone; only bed changes notify.
        assert!(model.update(&sources).is_empty());
        sources.printer.heaters[1].1.temperature = 61.0;
        let notifications = model.update(&sources);
        assert_eq!(notifications.len(), 1);
        assert!(notifications[0].1.contains_key("heater_bed"));
    }

    #[test]
    fn test_subscribers_diff_independently() {
        let mut model = ObjectModel::new();
        let mut sources = sources();
        model.subscribe(1, vec![all_of("extruder")], &sources);
        sources.printer.heaters[0].1.temperature = 220.0;
        // Subscriber 2 joins after the change; its baseline includes it.
        model.subscribe(2, vec![all_of("extruder")], &sources);
        let notifications = model.update(&sources);
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].0, 1);
    }

    #[test]
    fn test_dynamic_sensor_discovery() {
        let mut model = ObjectModel::new();
        let mut sources = sources();
        sources.printer.heaters.push((
            "C".to_string(),
            HeaterReading {
                temperature: 35.0,
                target: 0.0,
                power: 0.0,
            },
        ));
        sources.printer.heaters.push((
            "T1".to_string(),
            HeaterReading {
                temperature: 180.0,
                target: 180.0,
                power: 0.25,
            },
        ));
        let status = model.query(
            &sources,
            &[all_of("temperature_sensor chamber"), all_of("extruder1")],
        );
        assert_eq!(status["temperature_sensor chamber"]["temperature"], json!(35.0));
        assert!(status["temperature_sensor chamber"]
            .as_object()
            .unwrap()
            .get("target")
            .is_none());
        assert_eq!(status["extruder1"]["target"], json!(180.0));
    }

    #[test]
    fn test_unavailable_objects_are_skipped() {
        let mut model = ObjectModel::new();
        let mut sources = sources();
        sources.printer.state = PrinterState::Startup;
        let status = model.query(&sources, &[all_of("toolhead"), all_of("webhooks")]);
        assert!(!status.contains_key("toolhead"));
        assert_eq!(status["webhooks"]["state"], json!("startup"));
    }

    #[test]
    fn test_subscribe_withholds_unavailable_objects() {
        let mut model = ObjectModel::new();
        let mut sources = sources();
        sources.printer.state = PrinterState::Startup;
        let status = model.subscribe(1, vec![all_of("toolhead"), all_of("webhooks")], &sources);
        // No empty placeholder; the key is simply absent.
        assert!(!status.contains_key("toolhead"));
        assert!(status.contains_key("webhooks"));
        // Once the printer comes up, the first diff carries the full value.
        sources.printer.state = PrinterState::Ready;
        let notifications = model.update(&sources);
        assert_eq!(notifications.len(), 1);
        let toolhead = notifications[0].1["toolhead"].as_object().unwrap();
        assert!(toolhead.contains_key("position"));
        assert!(toolhead.contains_key("homed_axes"));
    }

    #[test]
    fn test_job_progress_flows_through_virtual_sdcard() {
        let mut model = ObjectModel::new();
        let mut sources = sources();
        model.subscribe(1, vec![all_of("virtual_sdcard"), all_of("print_stats")], &sources);
        sources.job.state = JobState::Printing;
        sources.job.filename = Some("benchy.gcode".to_string());
        sources.job.progress = 0.25;
        sources.job.file_position = 250;
        sources.job.file_size = 1000;
        let notifications = model.update(&sources);
        let status = &notifications[0].1;
        assert_eq!(status["virtual_sdcard"]["progress"], json!(0.25));
        assert_eq!(status["virtual_sdcard"]["is_active"], json!(true));
        assert_eq!(status["print_stats"]["state"], json!("printing"));
        assert_eq!(status["print_stats"]["filename"], json!("benchy.gcode"));
    }
}
