use serde::{Serialize, Deserialize};

#[derive(Serialize, Deserialize)]
pub struct RunGcodeScript {
    pub script: String,
}
#[derive(Serialize, Deserialize)]
pub struct StartPrint {
    pub filename: String,
}

//////
// Printer
//////
pub const PRINTER_INFO: &str = "/printer/info";
pub const RUN_GCODE_SCRIPT: &str = "/printer/gcode/script";
pub const EMERGENCY_STOP: &str = "/printer/emergency_stop";
pub const RESTART_PRINTER: &str = "/printer/restart";
pub const LIST_SD_FILES: &str = "/printer/sd_files";

//////
// Job
//////
pub const PRINT_START: &str = "/printer/print/start";
pub const PRINT_PAUSE: &str = "/printer/print/pause";
pub const PRINT_RESUME: &str = "/printer/print/resume";
pub const PRINT_CANCEL: &str = "/printer/print/cancel";

//////
// Status
//////
pub const SERVER_INFO: &str = "/server/info";
pub const RPC_WEBSOCKET: &str = "/websocket";
pub const CONSOLE_WEBSOCKET: &str = "/websocket/console";
