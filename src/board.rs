use anyhow::{ensure, Context, Result};
use log::{info, warn};

use crate::config::BoardProfile;
use crate::digest::BlobDigests;
use crate::fdt::{self, DtbBlob};
use crate::firmware::Firmware;
use crate::fit::{self, HashOutcome};
use crate::patch::{self, PatchOutcome};

/// Outcome of one rule, keyed by the LED name it targeted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleResult {
    pub led: String,
    pub outcome: PatchOutcome,
}

/// Everything one board's transform produced, for the caller to report
/// and judge (e.g. zero applied rules is that board's failure).
#[derive(Debug, Clone)]
pub struct BoardReport {
    pub board: String,
    pub dtb_index: usize,
    pub rules: Vec<RuleResult>,
    pub hashes: Vec<HashOutcome>,
}

impl BoardReport {
    pub fn changed(&self) -> usize {
        self.rules.iter().filter(|r| r.outcome.changed()).count()
    }
}

/// Pick the blob a profile targets: explicit index from the profile, then
/// the CLI override, else the first blob in scan order whose tree contains
/// any of the requested `/leds/<name>` nodes. First match wins.
pub fn select_blob<'a>(
    fw: &Firmware,
    blobs: &'a [DtbBlob],
    profile: &BoardProfile,
    override_index: Option<usize>,
) -> Result<&'a DtbBlob> {
    if let Some(index) = profile.dtb_index.or(override_index) {
        ensure!(
            index < blobs.len(),
            "dtb_index {index} out of range ({} blobs found)",
            blobs.len()
        );
        return Ok(&blobs[index]);
    }

    let wanted: Vec<String> = profile.leds.iter().map(|r| r.node_path()).collect();
    for blob in blobs {
        let tree = match fdt::walk(fw, blob) {
            Ok(tree) => tree,
            Err(err) => {
                warn!("Skipping unparseable DTB {}: {err:#}", blob.index);
                continue;
            }
        };
        if wanted.iter().any(|path| tree.has_node(path)) {
            return Ok(blob);
        }
    }
    anyhow::bail!("no DTB contains any of the requested LED nodes: {}", wanted.join(", "));
}

/// Apply one board's rules to the image, then re-sync the outer FIT hash
/// records unless disabled. The image passed in is this board's private
/// copy; the caller decides what to do with the report.
pub fn patch_board(
    fw: &mut Firmware,
    blobs: &[DtbBlob],
    board: &str,
    profile: &BoardProfile,
    override_index: Option<usize>,
    sync_hash: bool,
) -> Result<BoardReport> {
    let blob = select_blob(fw, blobs, profile, override_index)?.clone();
    let tree = fdt::walk(fw, &blob)
        .with_context(|| format!("DTB {} is not parseable", blob.index))?;
    info!(
        "Applying board '{board}' to DTB {} (offset {:#x}) with {} rule(s)",
        blob.index,
        blob.offset,
        profile.leds.len()
    );

    let pre = BlobDigests::over(fw, &blob);

    let mut rules = vec![];
    for rule in &profile.leds {
        let outcome = match tree.prop(&rule.node_path(), "gpios") {
            Some(prop) => patch::apply_rule(fw, prop, rule)?,
            None => PatchOutcome::Missing,
        };
        if !outcome.changed() {
            warn!("{}: {outcome}", rule.node_path());
        }
        rules.push(RuleResult {
            led: rule.name.clone(),
            outcome,
        });
    }

    let changed = rules.iter().filter(|r| r.outcome.changed()).count();
    let hashes = if changed > 0 && sync_hash {
        let post = BlobDigests::over(fw, &blob);
        info!(
            "DTB {} digest update: crc32 {} -> {}",
            blob.index,
            hex(&pre.crc32),
            hex(&post.crc32)
        );
        fit::sync_hashes(fw, blobs, &pre, &post)?
    } else {
        vec![]
    };

    Ok(BoardReport {
        board: board.to_string(),
        dtb_index: blob.index,
        rules,
        hashes,
    })
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
