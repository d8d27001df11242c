use anyhow::Result;
use serde::Deserialize;

use crate::fdt::PropertyRef;
use crate::firmware::Firmware;

/// The gpios payload is the conventional <phandle, pin, flags> triplet;
/// only the pin cell is ever rewritten.
pub const GPIO_CELL: usize = 1;
pub const GPIOS_LEN: usize = 12;

/// One LED remap: `/leds/<name>` gpios pin cell becomes `gpio`, optionally
/// guarded by the value it is expected to hold beforehand.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PatchRule {
    pub name: String,
    pub gpio: u32,
    #[serde(default)]
    pub expect: Option<u32>,
}

impl PatchRule {
    pub fn node_path(&self) -> String {
        format!("/leds/{}", self.name)
    }
}

/// Per-rule result, collected rather than raised so one bad rule never
/// aborts the rest of a board's rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    Applied { old: u32 },
    AlreadySet,
    Mismatch { expected: u32, actual: u32 },
    UnsupportedSize { len: usize },
    Missing,
}

impl PatchOutcome {
    /// True only when bytes were written.
    pub fn changed(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

impl std::fmt::Display for PatchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Applied { old } => write!(f, "patched (pin cell was {old:#x})"),
            Self::AlreadySet => write!(f, "already set, no change"),
            Self::Mismatch { expected, actual } => {
                write!(f, "mismatch (expected {expected:#x}, found {actual:#x}), left unpatched")
            }
            Self::UnsupportedSize { len } => {
                write!(f, "unsupported gpios size {len} (want {GPIOS_LEN}), left unpatched")
            }
            Self::Missing => write!(f, "node or gpios property missing"),
        }
    }
}

/// Patch the pin cell of one gpios triplet in place. Exactly 4 bytes are
/// written on `Applied`; every other outcome leaves the image untouched.
pub fn apply_rule(fw: &mut Firmware, prop: &PropertyRef, rule: &PatchRule) -> Result<PatchOutcome> {
    if prop.value_len != GPIOS_LEN {
        return Ok(PatchOutcome::UnsupportedSize { len: prop.value_len });
    }
    let actual = prop.cell(fw, GPIO_CELL)?;
    if let Some(expected) = rule.expect {
        if actual != expected {
            return Ok(PatchOutcome::Mismatch { expected, actual });
        }
    }
    if actual == rule.gpio {
        return Ok(PatchOutcome::AlreadySet);
    }
    fw.write_be32(prop.value_offset + GPIO_CELL * 4, rule.gpio)?;
    Ok(PatchOutcome::Applied { old: actual })
}
