use anyhow::Result;
use log::{info, warn};

use crate::digest::{BlobDigests, HashAlgo};
use crate::fdt::{self, DtbBlob, FdtTree};
use crate::firmware::Firmware;

/// One `/images/<name>/hash-<n>` record in the outer FIT tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashOutcome {
    pub node: String,
    pub algo: HashAlgo,
    pub status: HashStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashStatus {
    /// Stored value matched the pre-patch digest and was replaced.
    Updated,
    /// Stored value did not match; left untouched.
    Stale,
}

impl std::fmt::Display for HashOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            HashStatus::Updated => write!(f, "{} {}: updated", self.node, self.algo),
            HashStatus::Stale => write!(f, "{} {}: no match, left stale", self.node, self.algo),
        }
    }
}

/// The FIT container is itself a DTB: the first blob whose tree carries
/// both `/images` and `/configurations` nodes.
pub fn detect_fit<'a>(fw: &Firmware, blobs: &'a [DtbBlob]) -> Option<(&'a DtbBlob, FdtTree)> {
    for blob in blobs {
        let tree = match fdt::walk(fw, blob) {
            Ok(tree) => tree,
            Err(err) => {
                warn!("Skipping unparseable DTB {} during FIT detection: {err:#}", blob.index);
                continue;
            }
        };
        if tree.has_node("/images") && tree.has_node("/configurations") {
            return Some((blob, tree));
        }
    }
    None
}

/// After a blob was mutated, replace every FIT hash value whose stored
/// bytes equal the pre-patch digest of its algorithm with the post-patch
/// digest. Values are never resized; a value that matches nothing is left
/// stale with a warning (the image will then fail bootloader verification).
pub fn sync_hashes(
    fw: &mut Firmware,
    blobs: &[DtbBlob],
    pre: &BlobDigests,
    post: &BlobDigests,
) -> Result<Vec<HashOutcome>> {
    let Some((fit, tree)) = detect_fit(fw, blobs) else {
        warn!("FIT image DTB not detected; hash values left untouched");
        return Ok(vec![]);
    };
    info!("FIT detected in DTB {} (offset {:#x})", fit.index, fit.offset);

    let mut outcomes = vec![];
    for node in hash_nodes(&tree) {
        let Some(algo_prop) = tree.prop(&node, "algo") else {
            continue;
        };
        let Some(tag) = HashAlgo::from_tag(&fdt::prop_cstr(algo_prop.bytes(fw))) else {
            continue;
        };
        let Some(value) = tree.prop(&node, "value") else {
            continue;
        };
        if value.value_len != tag.digest_len() {
            warn!(
                "{node}: {tag} value has length {}, expected {}; skipping",
                value.value_len,
                tag.digest_len()
            );
            continue;
        }
        let status = if value.bytes(fw) == pre.of(tag) {
            fw.write_bytes(value.value_offset, post.of(tag))?;
            HashStatus::Updated
        } else {
            HashStatus::Stale
        };
        outcomes.push(HashOutcome {
            node: node.clone(),
            algo: tag,
            status,
        });
    }

    if !outcomes.iter().any(|o| o.status == HashStatus::Updated) {
        warn!("No matching FIT hash node for modified DTB; outer digests left stale");
    }
    Ok(outcomes)
}

fn hash_nodes(tree: &FdtTree) -> Vec<String> {
    tree.node_paths
        .iter()
        .filter(|path| {
            let parts: Vec<&str> = path.trim_matches('/').split('/').collect();
            parts.len() >= 3
                && parts[0] == "images"
                && parts.last().is_some_and(|p| p.starts_with("hash"))
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::{crc32_be, sha1};
    use crate::fdt::scan;
    use crate::testutil::{fit_wrapping, leds_dtb};

    #[test]
    fn detects_fit_and_inner_blob() {
        let inner = leds_dtb(&[("green", [0, 4, 1])]);
        let fw = Firmware::from_bytes(fit_wrapping(&inner));
        let blobs = scan(&fw);
        assert_eq!(blobs.len(), 2);

        let (fit, _) = detect_fit(&fw, &blobs).unwrap();
        assert_eq!(fit.index, 0);
    }

    #[test]
    fn matching_values_are_replaced() {
        let inner = leds_dtb(&[("green", [0, 4, 1])]);
        let mut fw = Firmware::from_bytes(fit_wrapping(&inner));
        let blobs = scan(&fw);
        let target = blobs[1].clone();

        let pre = BlobDigests::over(&fw, &target);
        // Simulate a patch on the inner blob, then sync.
        let gpios = fdt::walk(&fw, &target)
            .unwrap()
            .prop("/leds/green", "gpios")
            .unwrap()
            .clone();
        fw.write_be32(gpios.value_offset + 4, 8).unwrap();
        let post = BlobDigests::over(&fw, &target);

        let outcomes = sync_hashes(&mut fw, &blobs, &pre, &post).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.status == HashStatus::Updated));

        // Stored values now equal digests recomputed over the patched range.
        let fit_tree = fdt::walk(&fw, &blobs[0]).unwrap();
        let patched = &fw[target.range()];
        assert_eq!(
            fit_tree.prop("/images/fdt-1/hash-1", "value").unwrap().bytes(&fw),
            crc32_be(patched)
        );
        assert_eq!(
            fit_tree.prop("/images/fdt-1/hash-2", "value").unwrap().bytes(&fw),
            sha1(patched)
        );
    }

    #[test]
    fn mismatching_values_are_left_stale() {
        let inner = leds_dtb(&[("green", [0, 4, 1])]);
        let mut fw = Firmware::from_bytes(fit_wrapping(&inner));
        let blobs = scan(&fw);
        let target = blobs[1].clone();
        let before = fw.0.clone();

        // Digests that never belonged to this image.
        let pre = BlobDigests {
            crc32: [1, 2, 3, 4],
            sha1: [7; 20],
        };
        let post = BlobDigests::over(&fw, &target);

        let outcomes = sync_hashes(&mut fw, &blobs, &pre, &post).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.status == HashStatus::Stale));
        assert_eq!(fw.0, before);
    }

    #[test]
    fn no_fit_means_no_outcomes() {
        let fw0 = Firmware::from_bytes(leds_dtb(&[("green", [0, 4, 1])]));
        let blobs = scan(&fw0);
        let pre = BlobDigests::over(&fw0, &blobs[0]);
        let mut fw = fw0.clone();
        let outcomes = sync_hashes(&mut fw, &blobs, &pre, &pre).unwrap();
        assert!(outcomes.is_empty());
        assert_eq!(fw, fw0);
    }
}
