use anyhow::{bail, ensure, Result};
use deku::prelude::*;
use log::warn;
use std::collections::BTreeSet;
use std::ops::Range;

use crate::firmware::Firmware;

pub const FDT_MAGIC: u32 = 0xD00DFEED;
pub const DTB_HEADER_LEN: usize = 40;

const FDT_BEGIN_NODE: u32 = 0x1;
const FDT_END_NODE: u32 = 0x2;
const FDT_PROP: u32 = 0x3;
const FDT_NOP: u32 = 0x4;
const FDT_END: u32 = 0x9;

/// The 40-byte FDT header, all fields big-endian.
#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct DtbHeader {
    pub magic: u32,
    pub totalsize: u32,
    pub off_dt_struct: u32,
    pub off_dt_strings: u32,
    pub off_mem_rsvmap: u32,
    pub version: u32,
    pub last_comp_version: u32,
    pub boot_cpuid_phys: u32,
    pub size_dt_strings: u32,
    pub size_dt_struct: u32,
}

impl DtbHeader {
    /// Sanity-check the declared sizes against the enclosing image. Blocks
    /// must lie entirely inside `totalsize` and the blob inside the image.
    pub fn validate(&self, offset: usize, image_len: usize) -> Result<()> {
        ensure!(self.magic == FDT_MAGIC, "bad magic {:#010x}", self.magic);
        ensure!(
            self.totalsize as usize >= DTB_HEADER_LEN,
            "declared totalsize {} smaller than header",
            self.totalsize
        );
        ensure!(
            offset as u64 + self.totalsize as u64 <= image_len as u64,
            "blob extends past end of image"
        );
        let total = u64::from(self.totalsize);
        ensure!(
            u64::from(self.off_dt_struct) + u64::from(self.size_dt_struct) <= total,
            "structure block outside blob"
        );
        ensure!(
            u64::from(self.off_dt_strings) + u64::from(self.size_dt_strings) <= total,
            "strings block outside blob"
        );
        Ok(())
    }
}

/// A validated DTB found inside the image. Non-owning: `offset`/`totalsize`
/// locate it in the `Firmware` buffer, and its length never changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DtbBlob {
    pub index: usize,
    pub offset: usize,
    pub header: DtbHeader,
}

impl DtbBlob {
    pub fn len(&self) -> usize {
        self.header.totalsize as usize
    }

    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len()
    }
}

/// Scan the whole image for DTB magic values and return every candidate
/// whose header validates, in ascending offset order. Invalid candidates
/// are logged and skipped; an empty result is not an error.
pub fn scan(fw: &Firmware) -> Vec<DtbBlob> {
    let magic = FDT_MAGIC.to_be_bytes();
    let mut blobs = vec![];
    let mut at = 0usize;
    while at + 4 <= fw.len() {
        let Some(pos) = fw[at..].windows(4).position(|w| w == magic) else {
            break;
        };
        let offset = at + pos;
        match decode_header(fw, offset) {
            Ok(header) => blobs.push(DtbBlob {
                index: blobs.len(),
                offset,
                header,
            }),
            Err(err) => warn!("Skipping DTB candidate at {offset:#x}: {err:#}"),
        }
        at = offset + 4;
    }
    blobs
}

fn decode_header(fw: &Firmware, offset: usize) -> Result<DtbHeader> {
    ensure!(offset + DTB_HEADER_LEN <= fw.len(), "truncated header");
    let (_, header) = DtbHeader::from_bytes((&fw[offset..offset + DTB_HEADER_LEN], 0))?;
    header.validate(offset, fw.len())?;
    Ok(header)
}

/// Locates one property's payload inside the image. `value_offset` is
/// absolute; the payload is read and patched in place, never resized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyRef {
    pub node_path: String,
    pub name: String,
    pub value_offset: usize,
    pub value_len: usize,
}

impl PropertyRef {
    pub fn bytes<'a>(&self, fw: &'a Firmware) -> &'a [u8] {
        &fw[self.value_offset..self.value_offset + self.value_len]
    }

    /// Big-endian u32 cell at `index` within the payload.
    pub fn cell(&self, fw: &Firmware, index: usize) -> Result<u32> {
        ensure!(
            (index + 1) * 4 <= self.value_len,
            "cell {index} outside {}-byte property {}:{}",
            self.value_len,
            self.node_path,
            self.name
        );
        fw.read_be32(self.value_offset + index * 4)
    }
}

/// Everything one pass over a blob's structure block yields: all node
/// paths (including property-less nodes, needed for FIT detection) and
/// every property with its payload location.
#[derive(Debug, Clone, Default)]
pub struct FdtTree {
    pub node_paths: BTreeSet<String>,
    pub props: Vec<PropertyRef>,
}

impl FdtTree {
    pub fn has_node(&self, path: &str) -> bool {
        self.node_paths.contains(path)
    }

    pub fn prop(&self, node_path: &str, name: &str) -> Option<&PropertyRef> {
        self.props
            .iter()
            .find(|p| p.node_path == node_path && p.name == name)
    }

    /// Every 12-byte `gpios` property under `/leds/`, with its three cells
    /// decoded, in document order.
    pub fn led_gpios(&self, fw: &Firmware) -> Vec<(String, [u32; 3])> {
        self.props
            .iter()
            .filter(|p| p.node_path.starts_with("/leds/") && p.name == "gpios" && p.value_len == 12)
            .filter_map(|p| {
                let cells = [
                    p.cell(fw, 0).ok()?,
                    p.cell(fw, 1).ok()?,
                    p.cell(fw, 2).ok()?,
                ];
                Some((p.node_path.clone(), cells))
            })
            .collect()
    }
}

/// Decode the token stream of one blob. A malformed stream is an error
/// scoped to this blob; the caller decides whether that is fatal.
pub fn walk(fw: &Firmware, blob: &DtbBlob) -> Result<FdtTree> {
    let header = &blob.header;
    let base = blob.offset;
    let struct_end = (header.off_dt_struct + header.size_dt_struct) as usize;
    let strings_start = base + header.off_dt_strings as usize;
    let strings_end = strings_start + header.size_dt_strings as usize;

    let mut rel = header.off_dt_struct as usize;
    let mut stack: Vec<String> = vec![];
    let mut tree = FdtTree::default();

    loop {
        ensure!(rel + 4 <= struct_end, "truncated structure block");
        let token = fw.read_be32(base + rel)?;
        rel += 4;
        match token {
            FDT_BEGIN_NODE => {
                let name_bytes = &fw[base + rel..base + struct_end];
                let Some(nul) = name_bytes.iter().position(|&b| b == 0) else {
                    bail!("unterminated node name at {:#x}", base + rel);
                };
                let name = String::from_utf8_lossy(&name_bytes[..nul]).into_owned();
                rel = align4(rel + nul + 1);
                stack.push(name);
                tree.node_paths.insert(join_path(&stack));
            }
            FDT_END_NODE => {
                stack.pop();
            }
            FDT_PROP => {
                ensure!(rel + 8 <= struct_end, "truncated property header");
                let value_len = fw.read_be32(base + rel)? as usize;
                let name_off = fw.read_be32(base + rel + 4)? as usize;
                rel += 8;
                ensure!(rel + value_len <= struct_end, "truncated property payload");
                let name = read_strtab(fw, strings_start + name_off, strings_end)?;
                tree.props.push(PropertyRef {
                    node_path: join_path(&stack),
                    name,
                    value_offset: base + rel,
                    value_len,
                });
                rel = align4(rel + value_len);
            }
            FDT_NOP => {}
            FDT_END => break,
            other => bail!("unexpected FDT token {other:#x} at {:#x}", base + rel - 4),
        }
    }
    Ok(tree)
}

fn align4(x: usize) -> usize {
    (x + 3) & !3
}

fn join_path(stack: &[String]) -> String {
    let parts: Vec<&str> = stack
        .iter()
        .filter(|s| !s.is_empty())
        .map(String::as_str)
        .collect();
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

fn read_strtab(fw: &Firmware, start: usize, end: usize) -> Result<String> {
    ensure!(start < end && end <= fw.len(), "property name outside strings block");
    let Some(nul) = fw[start..end].iter().position(|&b| b == 0) else {
        bail!("unterminated property name at {start:#x}");
    };
    Ok(String::from_utf8_lossy(&fw[start..start + nul]).into_owned())
}

/// NUL-terminated string stored in a property payload (e.g. a FIT `algo`).
pub fn prop_cstr(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
