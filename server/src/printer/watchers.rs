use std::time::{Duration, Instant};

use super::{messages::FirmwareInfo, parser, PrinterData};

const TEMPERATURE_POLL_PERIOD: Duration = Duration::from_secs(1);
const POSITION_POLL_PERIOD: Duration = Duration::from_secs(1);

/// Whether the firmware pushes a report on its own schedule or the
/// bridge has to ask. Decided once per connection from the capability
/// flags; never changes afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportMode {
    AutoReport,
    Poll,
}

/// A per-capability strategy keeping one slice of printer state fresh.
/// The serial loop offers every received line to each watcher in
/// registration order; a claimed line never reaches the command
/// response accumulator.
pub trait Watcher: Send {
    fn name(&self) -> &'static str;
    fn handle(&mut self, line: &str, data: &mut PrinterData) -> bool;
    /// Query text due at `now`, if any. While a print job holds the
    /// channel the tick is consumed without producing a query, so polls
    /// are skipped rather than piling up behind the job.
    fn poll_command(&mut self, now: Instant, job_active: bool) -> Option<&'static str>;
    /// One-time enable command for auto-report firmwares.
    fn setup_command(&self) -> Option<&'static str>;
    /// Set once the first report has been observed; the connection
    /// sequence waits on all watchers before declaring the printer
    /// ready.
    fn is_loaded(&self) -> bool;
}

fn poll_tick(
    next_poll: &mut Instant,
    period: Duration,
    now: Instant,
    job_active: bool,
    query: &'static str,
) -> Option<&'static str> {
    if now < *next_poll {
        return None;
    }
    *next_poll = now + period;
    if job_active {
        None
    } else {
        Some(query)
    }
}

pub struct TemperatureWatcher {
    mode: ReportMode,
    loaded: bool,
    next_poll: Instant,
}

impl TemperatureWatcher {
    pub fn new(mode: ReportMode) -> Self {
        TemperatureWatcher {
            mode,
            loaded: false,
            next_poll: Instant::now(),
        }
    }
}

impl Watcher for TemperatureWatcher {
    fn name(&self) -> &'static str {
        "temperature"
    }
    fn handle(&mut self, line: &str, data: &mut PrinterData) -> bool {
        match parser::parse_temperatures(line) {
            Some(report) => {
                data.apply_temperatures(&report);
                self.loaded = true;
                true
            }
            None => false,
        }
    }
    fn poll_command(&mut self, now: Instant, job_active: bool) -> Option<&'static str> {
        match self.mode {
            ReportMode::AutoReport => None,
            ReportMode::Poll => poll_tick(
                &mut self.next_poll,
                TEMPERATURE_POLL_PERIOD,
                now,
                job_active,
                "M105",
            ),
        }
    }
    fn setup_command(&self) -> Option<&'static str> {
        match self.mode {
            ReportMode::AutoReport => Some("M155 S1"),
            ReportMode::Poll => None,
        }
    }
    fn is_loaded(&self) -> bool {
        self.loaded
    }
}

pub struct PositionWatcher {
    mode: ReportMode,
    loaded: bool,
    next_poll: Instant,
}

impl PositionWatcher {
    pub fn new(mode: ReportMode) -> Self {
        PositionWatcher {
            mode,
            loaded: false,
            next_poll: Instant::now(),
        }
    }
}

impl Watcher for PositionWatcher {
    fn name(&self) -> &'static str {
        "position"
    }
    fn handle(&mut self, line: &str, data: &mut PrinterData) -> bool {
        match parser::parse_position(line) {
            Some(report) => {
                data.motion.apply_report(&report);
                self.loaded = true;
                true
            }
            None => false,
        }
    }
    fn poll_command(&mut self, now: Instant, job_active: bool) -> Option<&'static str> {
        match self.mode {
            ReportMode::AutoReport => None,
            ReportMode::Poll => poll_tick(
                &mut self.next_poll,
                POSITION_POLL_PERIOD,
                now,
                job_active,
                "M114",
            ),
        }
    }
    fn setup_command(&self) -> Option<&'static str> {
        match self.mode {
            ReportMode::AutoReport => Some("M154 S1"),
            ReportMode::Poll => None,
        }
    }
    fn is_loaded(&self) -> bool {
        self.loaded
    }
}

/// Capability detection decides the strategy per capability at setup
/// time, for the life of the connection.
pub fn build_watchers(info: &FirmwareInfo) -> Vec<Box<dyn Watcher>> {
    let temperature_mode = if info.capability("AUTOREPORT_TEMP") {
        ReportMode::AutoReport
    } else {
        ReportMode::Poll
    };
    let position_mode = if info.capability("AUTOREPORT_POS") || info.capability("AUTOREPORT_POSITION")
    {
        ReportMode::AutoReport
    } else {
        ReportMode::Poll
    };
    vec![
        Box::new(TemperatureWatcher::new(temperature_mode)),
        Box::new(PositionWatcher::new(position_mode)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> PrinterData {
        PrinterData::default()
    }

    #[test]
    fn test_mode_selection_from_capabilities() {
        let info = parser::parse_firmware_info(
            "FIRMWARE_NAME:Marlin 2.1 MACHINE_TYPE:RepRap EXTRUDER_COUNT:1\nCap:AUTOREPORT_TEMP:1\nCap:AUTOREPORT_POS:0\n",
        )
        .unwrap();
        let mut watchers = build_watchers(&info);
        let now = Instant::now();
        // Auto-report temperature never polls; position falls back to M114.
        assert_eq!(watchers[0].poll_command(now, false), None);
        assert_eq!(watchers[1].poll_command(now, false), Some("M114"));
        assert_eq!(watchers[0].setup_command(), Some("M155 S1"));
        assert_eq!(watchers[1].setup_command(), None);
    }

    #[test]
    fn test_temperature_watcher_claims_only_temperature_lines() {
        let mut watcher = TemperatureWatcher::new(ReportMode::AutoReport);
        let mut data = data();
        assert!(!watcher.is_loaded());
        assert!(watcher.handle(" T:200.00 /205.00 B:60.00 /60.00", &mut data));
        assert!(watcher.is_loaded());
        assert!(!watcher.handle("X:0.00 Y:0.00 Z:0.00 E:0.00", &mut data));
        assert_eq!(data.heaters.len(), 2);
        assert_eq!(data.heaters[0].0, "T");
        assert_eq!(data.heaters[0].1.target, 205.0);
    }

    #[test]
    fn test_position_watcher_updates_motion() {
        let mut watcher = PositionWatcher::new(ReportMode::Poll);
        let mut data = data();
        assert!(watcher.handle("X:5.00 Y:6.00 Z:7.00 E:8.00 Count X:400", &mut data));
        assert_eq!(data.motion.position, [5.0, 6.0, 7.0, 8.0]);
        assert!(watcher.is_loaded());
    }

    #[test]
    fn test_poll_skipped_outright_while_job_active() {
        let mut watcher = TemperatureWatcher::new(ReportMode::Poll);
        let now = Instant::now();
        assert_eq!(watcher.poll_command(now, true), None);
        // The tick was consumed, not deferred: nothing fires until the
        // next period even though the job released the channel.
        assert_eq!(watcher.poll_command(now, false), None);
        assert_eq!(
            watcher.poll_command(now + TEMPERATURE_POLL_PERIOD, false),
            Some("M105")
        );
    }
}
