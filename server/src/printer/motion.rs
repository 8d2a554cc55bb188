use super::{messages::PositionReport, parser};

/// Motion state reconstructed from the requests the bridge itself
/// sends. Marlin does not echo position deltas, so this is the only
/// source of toolhead position between M114 reports.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionState {
    pub position: [f64; 4], // X, Y, Z, E
    pub absolute_xyz: bool,
    pub absolute_e: bool,
    pub feedrate: f64,   // mm/min, last F word seen
    pub fan_speed: f64,  // 0..1
    pub speed_factor: f64,
    pub extrude_factor: f64,
    pub homed: [bool; 3],
}

impl Default for MotionState {
    fn default() -> Self {
        MotionState {
            position: [0.0; 4],
            absolute_xyz: true,
            absolute_e: true,
            feedrate: 0.0,
            fan_speed: 0.0,
            speed_factor: 1.0,
            extrude_factor: 1.0,
            homed: [false; 3],
        }
    }
}

impl MotionState {
    /// Request-line introspection: called for every line dispatched to
    /// the firmware, in dispatch order.
    pub fn observe(&mut self, line: &str) {
        let command = match parser::parse_command(line) {
            Some(command) => command,
            None => return,
        };
        match command.opcode.as_str() {
            // G90/G91 switch the E axis too on Marlin; M82/M83 override
            // E independently afterwards.
            "G90" => {
                self.absolute_xyz = true;
                self.absolute_e = true;
            }
            "G91" => {
                self.absolute_xyz = false;
                self.absolute_e = false;
            }
            "M82" => self.absolute_e = true,
            "M83" => self.absolute_e = false,
            "G92" => {
                for (axis, letter) in ['X', 'Y', 'Z', 'E'].into_iter().enumerate() {
                    if let Some(value) = command.word(letter) {
                        self.position[axis] = value;
                    }
                }
            }
            "G28" => {
                let axes: Vec<usize> = ['X', 'Y', 'Z']
                    .into_iter()
                    .enumerate()
                    .filter(|(_, letter)| command.has_word(*letter))
                    .map(|(axis, _)| axis)
                    .collect();
                let axes = if axes.is_empty() { vec![0, 1, 2] } else { axes };
                for axis in axes {
                    self.position[axis] = 0.0;
                    self.homed[axis] = true;
                }
            }
            "M106" => {
                let s = command.word('S').unwrap_or(255.0);
                self.fan_speed = (s / 255.0).clamp(0.0, 1.0);
            }
            "M107" => self.fan_speed = 0.0,
            "M220" => {
                if let Some(s) = command.word('S') {
                    self.speed_factor = s / 100.0;
                }
            }
            "M221" => {
                if let Some(s) = command.word('S') {
                    self.extrude_factor = s / 100.0;
                }
            }
            "G0" | "G1" => {
                if let Some(feedrate) = command.word('F') {
                    self.feedrate = feedrate;
                }
                for (axis, letter) in ['X', 'Y', 'Z'].into_iter().enumerate() {
                    if let Some(value) = command.word(letter) {
                        if self.absolute_xyz {
                            self.position[axis] = value;
                        } else {
                            self.position[axis] += value;
                        }
                    }
                }
                if let Some(value) = command.word('E') {
                    if self.absolute_e {
                        self.position[3] = value;
                    } else {
                        self.position[3] += value;
                    }
                }
            }
            _ => {}
        }
    }

    /// An M114 report is authoritative; it overrides whatever the
    /// introspection accumulated.
    pub fn apply_report(&mut self, report: &PositionReport) {
        self.position = report.position;
    }

    pub fn homed_axes(&self) -> String {
        ['x', 'y', 'z']
            .into_iter()
            .zip(self.homed)
            .filter(|(_, homed)| *homed)
            .map(|(letter, _)| letter)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_move_after_g91() {
        let mut motion = MotionState::default();
        motion.observe("G91");
        motion.observe("G1 X10");
        assert_eq!(motion.position, [10.0, 0.0, 0.0, 0.0]);
        motion.observe("G1 X-2.5 Y4");
        assert_eq!(motion.position, [7.5, 4.0, 0.0, 0.0]);
    }

    #[test]
    fn test_absolute_move() {
        let mut motion = MotionState::default();
        motion.observe("G1 X10 Y20 Z0.3 F3000");
        assert_eq!(motion.position, [10.0, 20.0, 0.3, 0.0]);
        assert_eq!(motion.feedrate, 3000.0);
        motion.observe("G1 X5");
        assert_eq!(motion.position[0], 5.0);
    }

    #[test]
    fn test_e_mode_independent_of_xyz() {
        let mut motion = MotionState::default();
        motion.observe("G90");
        motion.observe("M83");
        motion.observe("G1 X10 E2");
        motion.observe("G1 X20 E2");
        assert_eq!(motion.position, [20.0, 0.0, 0.0, 4.0]);
    }

    #[test]
    fn test_g92_sets_logical_position() {
        let mut motion = MotionState::default();
        motion.observe("G1 E95.2");
        motion.observe("G92 E0");
        assert_eq!(motion.position[3], 0.0);
        motion.observe("G1 E1.5");
        assert_eq!(motion.position[3], 1.5);
    }

    #[test]
    fn test_homing() {
        let mut motion = MotionState::default();
        motion.observe("G1 X10 Y10 Z10");
        motion.observe("G28 X Y");
        assert_eq!(motion.position, [0.0, 0.0, 10.0, 0.0]);
        assert_eq!(motion.homed_axes(), "xy");
        motion.observe("G28");
        assert_eq!(motion.homed_axes(), "xyz");
    }

    #[test]
    fn test_fan_and_factors() {
        let mut motion = MotionState::default();
        motion.observe("M106 S127.5");
        assert_eq!(motion.fan_speed, 0.5);
        motion.observe("M107");
        assert_eq!(motion.fan_speed, 0.0);
        motion.observe("M220 S150");
        motion.observe("M221 S95");
        assert_eq!(motion.speed_factor, 1.5);
        assert_eq!(motion.extrude_factor, 0.95);
    }
}
