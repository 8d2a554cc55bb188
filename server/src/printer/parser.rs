use {
    super::messages::{FirmwareInfo, GcodeCommand, HeaterSample, PositionReport, TemperatureReport},
    common::status::SdFileEntry,
    nom::{
        branch::alt,
        bytes::complete::{tag, take_until, take_while, take_while1},
        combinator::{all_consuming, map_res, opt},
        sequence::{pair, preceded, separated_pair},
        IResult, Parser,
    },
    thiserror::Error,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("response is missing expected marker {0:?}")]
    MissingMarker(&'static str),
}

/// Terminator of every firmware response. Marlin may append payload to
/// the token itself (`ok T:...`, `ok N12 P15 B3`).
pub fn is_ok(line: &str) -> bool {
    let line = line.trim_start();
    line == "ok" || line.starts_with("ok ") || line.starts_with("ok\t") || line.starts_with("ok:")
}

/// Payload following the `ok` token, if any.
pub fn ok_payload(line: &str) -> Option<&str> {
    let line = line.trim_start();
    let rest = line.strip_prefix("ok")?.trim_start_matches([' ', '\t', ':']);
    if rest.is_empty() {
        None
    } else {
        Some(rest)
    }
}

fn parse_f64(input: &str) -> IResult<&str, f64> {
    map_res(
        take_while1(|c: char| c.is_ascii_digit() || c == '.' || c == '-' || c == '+'),
        |substr: &str| substr.parse::<f64>(),
    )
    .parse(input)
}
fn parse_u64(input: &str) -> IResult<&str, u64> {
    map_res(take_while1(|c: char| c.is_ascii_digit()), |substr: &str| {
        substr.parse::<u64>()
    })
    .parse(input)
}

/// `Cap:AUTOREPORT_TEMP:1`
pub fn parse_capability(line: &str) -> Option<(String, bool)> {
    let result: IResult<&str, (&str, &str)> = preceded(
        tag("Cap:"),
        separated_pair(take_until(":"), tag(":"), alt((tag("1"), tag("0")))),
    )
    .parse(line.trim());
    match result {
        Ok((_, (name, flag))) => Some((name.to_string(), flag == "1")),
        Err(_) => None,
    }
}

/// Splits an M115 banner line into `KEY:value` fields. Keys are runs of
/// uppercase letters, digits and underscores followed by a colon; the
/// value extends to the start of the next key.
fn split_banner_fields(line: &str) -> Vec<(&str, &str)> {
    fn is_key_byte(b: u8) -> bool {
        b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_'
    }
    let bytes = line.as_bytes();
    let mut key_spans = Vec::new();
    for (index, b) in bytes.iter().enumerate() {
        if *b != b':' {
            continue;
        }
        // Walk back over the candidate key.
        let mut start = index;
        while start > 0 && is_key_byte(bytes[start - 1]) {
            start -= 1;
        }
        let len = index - start;
        let preceded_by_space = start == 0 || bytes[start - 1] == b' ';
        if len >= 2 && preceded_by_space && bytes[start].is_ascii_uppercase() {
            key_spans.push((start, index));
        }
    }
    let mut fields = Vec::new();
    for (n, (start, colon)) in key_spans.iter().enumerate() {
        let value_end = key_spans
            .get(n + 1)
            .map(|(next_start, _)| *next_start)
            .unwrap_or(line.len());
        let key = &line[*start..*colon];
        let value = line[*colon + 1..value_end].trim();
        fields.push((key, value));
    }
    fields
}

/// Decodes a full M115 response: the banner line plus any number of
/// `Cap:` lines. Anything unrecognized is skipped; a response without a
/// `FIRMWARE_NAME` field is a decode fault.
pub fn parse_firmware_info(response: &str) -> Result<FirmwareInfo, DecodeError> {
    let mut firmware_name = None;
    let mut machine_type = None;
    let mut extruder_count = 1;
    let mut capabilities = Vec::new();
    for line in response.lines() {
        if let Some(capability) = parse_capability(line) {
            capabilities.push(capability);
            continue;
        }
        if !line.contains("FIRMWARE_NAME:") {
            continue;
        }
        for (key, value) in split_banner_fields(line) {
            match key {
                "FIRMWARE_NAME" => firmware_name = Some(value.to_string()),
                "MACHINE_TYPE" => machine_type = Some(value.to_string()),
                "EXTRUDER_COUNT" => {
                    if let Ok(count) = value.parse::<usize>() {
                        extruder_count = count;
                    }
                }
                _ => {}
            }
        }
    }
    match firmware_name {
        Some(firmware_name) => Ok(FirmwareInfo::new(
            firmware_name,
            machine_type,
            extruder_count,
            capabilities,
        )),
        None => Err(DecodeError::MissingMarker("FIRMWARE_NAME")),
    }
}

fn is_heater_key(key: &str) -> bool {
    // M114's X/Y/Z/E words look identical; only these prefixes name
    // temperature sensors in Marlin reports.
    let mut chars = key.chars();
    let first = match chars.next() {
        Some(c) => c,
        None => return false,
    };
    matches!(first, 'T' | 'B' | 'C' | 'P' | 'A' | 'R') && chars.all(|c| c.is_ascii_digit())
}

fn power_key_target(key: &str) -> Option<String> {
    // `@:127` belongs to the active hotend, `@1:64` to T1, `B@:0` to the
    // bed and so on.
    let stripped = key.strip_suffix('@');
    match (stripped, key.strip_prefix('@')) {
        (Some(""), _) | (None, Some("")) => Some("T".to_string()),
        (None, Some(index)) if index.chars().all(|c| c.is_ascii_digit()) => {
            Some(format!("T{}", index))
        }
        (Some(prefix), _) if is_heater_key(prefix) => Some(prefix.to_string()),
        _ => None,
    }
}

/// `T:200.00 /205.00 B:60.00 /60.00 @:127 B@:0`, with or without the
/// leading space or `ok` prefix Marlin uses on auto-report and M105
/// lines. Returns None when the line carries no heater readings at all,
/// so callers can use this as a claim test.
pub fn parse_temperatures(line: &str) -> Option<TemperatureReport> {
    let line = ok_payload(line).unwrap_or(line).trim();
    let mut report = TemperatureReport::default();
    let mut tokens = line.split_ascii_whitespace().peekable();
    while let Some(token) = tokens.next() {
        let (key, value) = match token.split_once(':') {
            Some(pair) => pair,
            None => continue,
        };
        if let Some(heater) = power_key_target(key) {
            if let Ok(power) = value.parse::<f64>() {
                if let Some((_, sample)) =
                    report.heaters.iter_mut().find(|(name, _)| *name == heater)
                {
                    sample.power = Some(power / 127.0);
                }
            }
            continue;
        }
        if !is_heater_key(key) {
            continue;
        }
        let current = match value.parse::<f64>() {
            Ok(current) => current,
            Err(_) => continue, // tolerate `W:?` and similar fragments
        };
        let target = tokens
            .peek()
            .and_then(|next| next.strip_prefix('/'))
            .and_then(|target| target.parse::<f64>().ok());
        if target.is_some() {
            tokens.next();
        }
        report.heaters.push((
            key.to_string(),
            HeaterSample {
                current,
                target,
                power: None,
            },
        ));
    }
    if report.heaters.is_empty() {
        None
    } else {
        Some(report)
    }
}

/// `X:0.00 Y:0.00 Z:0.00 E:0.00 Count X:0 Y:0 Z:0` (M114). The stepper
/// echo after `Count` is ignored.
pub fn parse_position(line: &str) -> Option<PositionReport> {
    let line = ok_payload(line).unwrap_or(line).trim();
    let mut position = [None::<f64>; 4];
    for token in line.split_ascii_whitespace() {
        if token == "Count" {
            break;
        }
        let (key, value) = match token.split_once(':') {
            Some(pair) => pair,
            None => continue,
        };
        let index = match key {
            "X" => 0,
            "Y" => 1,
            "Z" => 2,
            "E" => 3,
            _ => continue,
        };
        if let Ok(value) = value.parse::<f64>() {
            position[index] = Some(value);
        }
    }
    match position {
        [Some(x), Some(y), Some(z), e] => Some(PositionReport {
            position: [x, y, z, e.unwrap_or(0.0)],
        }),
        _ => None,
    }
}

fn parse_file_entry(line: &str) -> Option<SdFileEntry> {
    // `NAME.GCO 1234` optionally followed by a long display name.
    let mut parts = line.trim().splitn(3, ' ');
    let name = parts.next()?;
    if name.is_empty() {
        return None;
    }
    let size = parts.next()?;
    let (_, size) = all_consuming(parse_u64).parse(size).ok()?;
    let display_name = parts.next().map(|rest| rest.trim_matches('"').to_string());
    Some(SdFileEntry {
        name: name.to_string(),
        size,
        display_name,
    })
}

/// Entries of an M20 response, between the `Begin file list` header and
/// the `End file list` trailer. Unparseable entries are skipped.
pub fn parse_file_list(response: &str) -> Result<Vec<SdFileEntry>, DecodeError> {
    let mut entries = Vec::new();
    let mut in_listing = false;
    let mut saw_header = false;
    for line in response.lines() {
        let trimmed = line.trim();
        if trimmed == "Begin file list" {
            saw_header = true;
            in_listing = true;
            continue;
        }
        if trimmed == "End file list" {
            in_listing = false;
            continue;
        }
        if in_listing {
            if let Some(entry) = parse_file_entry(trimmed) {
                entries.push(entry);
            }
        }
    }
    if saw_header {
        Ok(entries)
    } else {
        Err(DecodeError::MissingMarker("Begin file list"))
    }
}

fn parse_endstop_line(line: &str) -> Option<(String, String)> {
    let result: IResult<&str, (&str, &str)> = all_consuming(separated_pair(
        take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
        pair(tag(":"), take_while(|c| c == ' ')),
        take_while1(|_| true),
    ))
    .parse(line.trim());
    match result {
        Ok((_, (key, value))) => Some((key.to_string(), value.trim().to_string())),
        Err(_) => None,
    }
}

/// `x_min: open` pairs of an M119 response.
pub fn parse_endstops(response: &str) -> Result<Vec<(String, String)>, DecodeError> {
    if !response.contains("Reporting endstop status") {
        return Err(DecodeError::MissingMarker("Reporting endstop status"));
    }
    Ok(response
        .lines()
        .filter(|line| !line.contains("Reporting endstop status"))
        .filter_map(parse_endstop_line)
        .collect())
}

fn parse_word(input: &str) -> IResult<&str, (char, Option<f64>)> {
    let (rest, letter) =
        take_while1(|c: char| c.is_ascii_alphabetic()).parse(input)?;
    let letter = letter.chars().next().unwrap().to_ascii_uppercase();
    let (rest, value) = opt(parse_f64).parse(rest)?;
    Ok((rest, (letter, value)))
}

/// Reduces an outbound request line to opcode + words, for motion-state
/// introspection. Comments and empty lines yield None.
pub fn parse_command(line: &str) -> Option<GcodeCommand> {
    let code = line.split(';').next().unwrap_or("").trim();
    if code.is_empty() {
        return None;
    }
    let mut tokens = code.split_ascii_whitespace();
    let opcode = tokens.next()?.to_ascii_uppercase();
    if !opcode.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return None;
    }
    let mut words = Vec::new();
    for token in tokens {
        if let Ok((_, word)) = all_consuming(parse_word).parse(token) {
            words.push(word);
        }
    }
    Some(GcodeCommand { opcode, words })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_ok() {
        assert!(is_ok("ok"));
        assert!(is_ok("ok N12 P15 B3"));
        assert!(is_ok("ok T:200.00 /205.00"));
        assert!(!is_ok("okay"));
        assert!(!is_ok("echo:ok"));
    }

    #[test]
    fn test_parse_capability() {
        assert_eq!(
            parse_capability("Cap:AUTOREPORT_TEMP:1"),
            Some(("AUTOREPORT_TEMP".to_string(), true))
        );
        assert_eq!(
            parse_capability("Cap:PROGRESS:0"),
            Some(("PROGRESS".to_string(), false))
        );
        assert_eq!(parse_capability("FIRMWARE_NAME:Marlin"), None);
    }

    #[test]
    fn test_parse_firmware_info() {
        let response = "FIRMWARE_NAME:Marlin 1.1.0 (Github) SOURCE_CODE_URL:https://github.com/MarlinFirmware/Marlin PROTOCOL_VERSION:1.0 MACHINE_TYPE:RepRap EXTRUDER_COUNT:1\nCap:AUTOREPORT_TEMP:1\nCap:AUTOREPORT_POS:0\n";
        let info = parse_firmware_info(response).unwrap();
        assert_eq!(info.firmware_name, "Marlin 1.1.0 (Github)");
        assert_eq!(info.machine_type.as_deref(), Some("RepRap"));
        assert_eq!(info.extruder_count, 1);
        assert!(info.capability("AUTOREPORT_TEMP"));
        assert!(!info.capability("AUTOREPORT_POS"));
        assert!(!info.capability("EMERGENCY_PARSER"));
    }

    #[test]
    fn test_parse_firmware_info_requires_banner() {
        assert_eq!(
            parse_firmware_info("echo:Unknown command: \"M115\"\n"),
            Err(DecodeError::MissingMarker("FIRMWARE_NAME"))
        );
    }

    #[test]
    fn test_parse_temperatures() {
        let report = parse_temperatures(" T:200.00 /205.00 B:60.00 /60.00").unwrap();
        let hotend = report.get("T").unwrap();
        assert_eq!(hotend.current, 200.0);
        assert_eq!(hotend.target, Some(205.0));
        let bed = report.get("B").unwrap();
        assert_eq!(bed.current, 60.0);
        assert_eq!(bed.target, Some(60.0));
    }

    #[test]
    fn test_parse_temperatures_with_power() {
        let report = parse_temperatures("ok T:201.52 /202.00 B:59.98 /60.00 @:127 B@:0").unwrap();
        assert_eq!(report.get("T").unwrap().power, Some(1.0));
        assert_eq!(report.get("B").unwrap().power, Some(0.0));
    }

    #[test]
    fn test_parse_temperatures_multi_extruder() {
        let report =
            parse_temperatures("T0:210.00 /210.00 T1:25.31 /0.00 @0:95 @1:0").unwrap();
        assert_eq!(report.heaters.len(), 2);
        assert_eq!(report.heaters[0].0, "T0");
        assert_eq!(report.get("T1").unwrap().target, Some(0.0));
    }

    #[test]
    fn test_parse_temperatures_rejects_position() {
        assert_eq!(parse_temperatures("X:0.00 Y:0.00 Z:0.00 E:0.00"), None);
    }

    #[test]
    fn test_parse_position() {
        let report =
            parse_position("X:1.00 Y:2.50 Z:-0.10 E:12.00 Count X:80 Y:200 Z:-40").unwrap();
        assert_eq!(report.position, [1.0, 2.5, -0.1, 12.0]);
    }

    #[test]
    fn test_parse_position_rejects_partial() {
        assert_eq!(parse_position("X:1.00 Y:2.00"), None);
        assert_eq!(parse_position("T:200.00 /205.00"), None);
    }

    #[test]
    fn test_parse_file_list() {
        let response = "Begin file list\nBENCHY.GCO 120394\nCUBE~1.GCO 4929 \"calibration cube.gcode\"\nEnd file list\nok\n";
        let entries = parse_file_list(response).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "BENCHY.GCO");
        assert_eq!(entries[0].size, 120394);
        assert_eq!(entries[0].display_name, None);
        assert_eq!(
            entries[1].display_name.as_deref(),
            Some("calibration cube.gcode")
        );
    }

    #[test]
    fn test_parse_file_list_requires_header() {
        assert_eq!(
            parse_file_list("echo:No SD card\nok\n"),
            Err(DecodeError::MissingMarker("Begin file list"))
        );
    }

    #[test]
    fn test_parse_endstops() {
        let response = "Reporting endstop status\nx_min: open\ny_min: TRIGGERED\nz_min: open\n";
        let endstops = parse_endstops(response).unwrap();
        assert_eq!(endstops.len(), 3);
        assert_eq!(endstops[1], ("y_min".to_string(), "TRIGGERED".to_string()));
    }

    #[test]
    fn test_parse_command_words() {
        let command = parse_command("G1 X10.5 Y-3 E0.42 F1500 ; infill").unwrap();
        assert_eq!(command.opcode, "G1");
        assert_eq!(command.word('X'), Some(10.5));
        assert_eq!(command.word('Y'), Some(-3.0));
        assert_eq!(command.word('F'), Some(1500.0));
        assert!(!command.has_word('Z'));
    }

    #[test]
    fn test_parse_command_bare_axis_words() {
        let command = parse_command("G28 X Y").unwrap();
        assert!(command.has_word('X'));
        assert!(command.has_word('Y'));
        assert_eq!(command.word('X'), None);
    }

    #[test]
    fn test_parse_command_skips_comments() {
        assert_eq!(parse_command("; pure comment"), None);
        assert_eq!(parse_command("   "), None);
    }
}
