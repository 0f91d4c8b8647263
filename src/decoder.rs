//! Opcode naming for session logs
//!
//! Maps a CDB to a readable command name and a log level using a table of
//! opcode groups loaded from TOML:
//!
//! ```toml
//! [groups."0xC4"]
//! name = "Vacuum"
//!
//! [[groups."0xC4".matches]]
//! name = "GetVacuumStatus"
//! level = "INFO"
//! match = { "1" = "0x01" }
//! ```
//!
//! A rule matches when every listed CDB offset holds the listed byte. The
//! first matching rule names the command. An opcode with a group but no
//! matching rule is `<group>_Generic`; an opcode with no group is
//! `Unknown(0xNN)`. Both of those log at WARN.
//!
//! Opcode `0xFA` tunnels another command in its data-out phase. The inner
//! CDB is decoded and, if known, the command is named `FA<inner>`.

use crate::error::{BridgeError, BridgeResult};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

/// Tunnel opcode carrying a nested CDB as its data
pub const TUNNEL_OPCODE: u8 = 0xFA;

/// Definitions for the commands the virtual SEM understands
pub const BUILTIN_DEFINITIONS: &str = r#"
[groups."0x12"]
name = "Inquiry"

[[groups."0x12".matches]]
name = "Inquiry"
match = {}

[groups."0x00"]
name = "Scan"

[[groups."0x00".matches]]
name = "SetScanSpeed"
match = { "1" = "0x01", "4" = "0x00" }

[[groups."0x00".matches]]
name = "SetScanStatus"
match = { "4" = "0x09" }

[groups."0x01"]
name = "VacuumControl"

[[groups."0x01".matches]]
name = "SetVacuumMode"
match = { "1" = "0x01", "4" = "0x06", "5" = "0x40", "6" = "0x44" }

[[groups."0x01".matches]]
name = "Evacuate"
match = { "1" = "0x01", "4" = "0x06", "5" = "0x40", "6" = "0x38", "9" = "0x01" }

[[groups."0x01".matches]]
name = "Vent"
level = "WARN"
match = { "1" = "0x01", "4" = "0x06", "5" = "0x40", "6" = "0x38" }

[groups."0x02"]
name = "HighTension"

[[groups."0x02".matches]]
name = "SetHtStatus"
match = { "1" = "0x01", "4" = "0x07" }

[[groups."0x02".matches]]
name = "SetAccv"
match = { "1" = "0x01", "4" = "0x08", "8" = "0x00" }

[[groups."0x02".matches]]
name = "SetFilament"
match = { "1" = "0x01", "4" = "0x08", "8" = "0x14" }

[groups."0x03"]
name = "Optics"

[[groups."0x03".matches]]
name = "SetMagnification"
match = { "1" = "0x01", "8" = "0x10" }

[groups."0x04"]
name = "Video"

[[groups."0x04".matches]]
name = "RequestVideo"
match = { "4" = "0x1E", "5" = "0x07" }

[groups."0xC4"]
name = "Vacuum"

[[groups."0xC4".matches]]
name = "GetVacuumStatus"
match = { "1" = "0x01" }

[[groups."0xC4".matches]]
name = "GetVacuumMode"
match = { "1" = "0x00" }

[groups."0xC5"]
name = "Valve"

[[groups."0xC5".matches]]
name = "GetValvePosition"
match = { "1" = "0x09" }

[groups."0xC6"]
name = "GunStatus"

[[groups."0xC6".matches]]
name = "GetHtStatus"
match = { "1" = "0x10" }

[[groups."0xC6".matches]]
name = "GetAccv"
match = { "1" = "0x11" }

[[groups."0xC6".matches]]
name = "GetFilament"
match = { "1" = "0x12" }

[groups."0xCC"]
name = "System"

[[groups."0xCC".matches]]
name = "GetHardwareId"
match = { "1" = "0x81" }

[groups."0xFA"]
name = "Tunnel"
"#;

/// Severity tag written into session log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Err,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INFO" => Some(LogLevel::Info),
            "WARN" | "WARNING" => Some(LogLevel::Warn),
            "ERR" | "ERROR" => Some(LogLevel::Err),
            _ => None,
        }
    }

    /// Four-character column label
    pub fn label(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Err => "ERR ",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Which half of an exchange a log line describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Command,
    Response,
}

impl Phase {
    pub fn tag(&self) -> &'static str {
        match self {
            Phase::Command => "CMD",
            Phase::Response => "RES",
        }
    }
}

/// A decoded command name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub name: String,
    pub level: LogLevel,
}

impl Decoded {
    fn new(name: impl Into<String>, level: LogLevel) -> Self {
        Decoded {
            name: name.into(),
            level,
        }
    }

    pub fn is_known(&self) -> bool {
        !self.name.contains("Unknown")
    }
}

#[derive(Debug, Clone)]
struct MatchRule {
    name: String,
    level: LogLevel,
    bytes: Vec<(usize, u8)>,
}

impl MatchRule {
    fn matches(&self, cdb: &[u8]) -> bool {
        self.bytes
            .iter()
            .all(|&(offset, value)| cdb.get(offset) == Some(&value))
    }
}

#[derive(Debug, Clone)]
struct OpcodeGroup {
    name: String,
    rules: Vec<MatchRule>,
}

/// Opcode table
#[derive(Debug, Clone, Default)]
pub struct OpcodeDecoder {
    groups: HashMap<u8, OpcodeGroup>,
}

impl OpcodeDecoder {
    /// Decoder for the commands the virtual SEM implements
    pub fn builtin() -> Self {
        Self::from_toml_str(BUILTIN_DEFINITIONS).unwrap_or_else(|e| {
            log::error!("Built-in opcode definitions rejected: {}", e);
            Self::default()
        })
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> BridgeResult<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            BridgeError::Config(format!("Cannot read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(s: &str) -> BridgeResult<Self> {
        let doc = s
            .parse::<toml::Value>()
            .map_err(|e| BridgeError::Config(format!("Invalid TOML: {}", e)))?;

        let mut groups = HashMap::new();
        let Some(table) = doc.get("groups") else {
            return Ok(OpcodeDecoder { groups });
        };
        let table = table
            .as_table()
            .ok_or_else(|| BridgeError::Config("groups must be a table".to_string()))?;

        for (key, group) in table {
            let opcode = parse_byte(key)
                .ok_or_else(|| BridgeError::Config(format!("Bad opcode key '{}'", key)))?;
            groups.insert(opcode, parse_group(key, group)?);
        }

        log::debug!("Loaded {} opcode groups", groups.len());
        Ok(OpcodeDecoder { groups })
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Name a command. `data` is the data-out phase for commands and the
    /// returned data for responses.
    pub fn decode(&self, cdb: &[u8], data: Option<&[u8]>, phase: Phase) -> Decoded {
        let Some(&opcode) = cdb.first() else {
            return Decoded::new("EmptyCDB", LogLevel::Warn);
        };

        let mut decoded = Decoded::new(format!("Unknown(0x{:02X})", opcode), LogLevel::Warn);
        if let Some(group) = self.groups.get(&opcode) {
            decoded.name = format!("{}_Generic", group.name);
            if let Some(rule) = group.rules.iter().find(|r| r.matches(cdb)) {
                decoded = Decoded::new(rule.name.clone(), rule.level);
            }
        }

        if opcode == TUNNEL_OPCODE {
            match (phase, data) {
                (Phase::Command, Some(inner)) if !inner.is_empty() => {
                    let nested = self.decode(inner, None, Phase::Command);
                    if nested.is_known() {
                        decoded = Decoded::new(format!("FA<{}>", nested.name), nested.level);
                    }
                }
                (Phase::Response, _) => decoded.name = "FA_Response".to_string(),
                _ => {}
            }
        }

        decoded
    }
}

fn parse_byte(s: &str) -> Option<u8> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

fn parse_group(key: &str, value: &toml::Value) -> BridgeResult<OpcodeGroup> {
    let name = value
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or("Unknown")
        .to_string();

    let mut rules = Vec::new();
    if let Some(matches) = value.get("matches") {
        let matches = matches.as_array().ok_or_else(|| {
            BridgeError::Config(format!("groups.\"{}\".matches must be an array", key))
        })?;
        for rule in matches {
            rules.push(parse_rule(key, rule)?);
        }
    }

    Ok(OpcodeGroup { name, rules })
}

fn parse_rule(key: &str, value: &toml::Value) -> BridgeResult<MatchRule> {
    let name = value
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or("UnknownGroupCmd")
        .to_string();

    let level = match value.get("level") {
        None => LogLevel::Info,
        Some(v) => v.as_str().and_then(LogLevel::parse).ok_or_else(|| {
            BridgeError::Config(format!("groups.\"{}\" rule {}: bad level {}", key, name, v))
        })?,
    };

    let mut bytes = Vec::new();
    if let Some(map) = value.get("match") {
        let map = map.as_table().ok_or_else(|| {
            BridgeError::Config(format!("groups.\"{}\" rule {}: match must be a table", key, name))
        })?;
        for (offset, byte) in map {
            let offset = offset.trim().parse::<usize>().map_err(|_| {
                BridgeError::Config(format!("groups.\"{}\" rule {}: bad offset '{}'", key, name, offset))
            })?;
            let byte = match byte {
                toml::Value::String(s) => parse_byte(s),
                toml::Value::Integer(i) => u8::try_from(*i).ok(),
                _ => None,
            }
            .ok_or_else(|| {
                BridgeError::Config(format!("groups.\"{}\" rule {}: bad byte {}", key, name, byte))
            })?;
            bytes.push((offset, byte));
        }
    }

    Ok(MatchRule { name, level, bytes })
}
