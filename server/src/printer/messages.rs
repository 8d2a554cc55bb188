/// Identification parsed from the M115 banner, plus the `Cap:` flag
/// lines Marlin appends to it.
#[derive(Debug, Clone, PartialEq)]
pub struct FirmwareInfo {
    pub firmware_name: String,
    pub machine_type: Option<String>,
    pub extruder_count: usize,
    capabilities: Vec<(String, bool)>,
}

impl FirmwareInfo {
    pub fn new(
        firmware_name: String,
        machine_type: Option<String>,
        extruder_count: usize,
        capabilities: Vec<(String, bool)>,
    ) -> Self {
        FirmwareInfo {
            firmware_name,
            machine_type,
            extruder_count,
            capabilities,
        }
    }
    /// Absent capabilities read as false; Marlin omits flags it predates.
    pub fn capability(&self, name: &str) -> bool {
        self.capabilities
            .iter()
            .find(|(cap, _)| cap == name)
            .map_or(false, |(_, enabled)| *enabled)
    }
    pub fn capabilities(&self) -> &[(String, bool)] {
        &self.capabilities
    }
}

/// One heater as it appears on a temperature line. Targets and power
/// are not reported in every shape of line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeaterSample {
    pub current: f64,
    pub target: Option<f64>,
    pub power: Option<f64>,
}

/// Heaters in the order the firmware printed them; sensor names are
/// only known at runtime.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TemperatureReport {
    pub heaters: Vec<(String, HeaterSample)>,
}

impl TemperatureReport {
    pub fn get(&self, name: &str) -> Option<&HeaterSample> {
        self.heaters
            .iter()
            .find(|(heater, _)| heater == name)
            .map(|(_, sample)| sample)
    }
}

/// Absolute toolhead position from an M114 response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionReport {
    pub position: [f64; 4], // X, Y, Z, E
}

/// A gcode request line reduced to its opcode and axis words, used to
/// introspect commands the bridge itself sends. Words without a value
/// still matter (`G28 X`).
#[derive(Debug, Clone, PartialEq)]
pub struct GcodeCommand {
    pub opcode: String,
    pub words: Vec<(char, Option<f64>)>,
}

impl GcodeCommand {
    pub fn word(&self, letter: char) -> Option<f64> {
        self.words
            .iter()
            .find(|(l, _)| *l == letter)
            .and_then(|(_, value)| *value)
    }
    pub fn has_word(&self, letter: char) -> bool {
        self.words.iter().any(|(l, _)| *l == letter)
    }
}
