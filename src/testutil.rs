//! Test-only builder for syntactically valid DTB/FIT images.

use std::collections::HashMap;

use crate::digest::{crc32_be, sha1};
use crate::fdt::{DTB_HEADER_LEN, FDT_MAGIC};

const FDT_BEGIN_NODE: u32 = 0x1;
const FDT_END_NODE: u32 = 0x2;
const FDT_PROP: u32 = 0x3;
const FDT_END: u32 = 0x9;

// Header + empty memory reservation block (one all-zero terminator entry).
const MEMRSV_LEN: usize = 16;
const STRUCT_OFFSET: usize = DTB_HEADER_LEN + MEMRSV_LEN;

pub struct FdtBuilder {
    structure: Vec<u8>,
    strings: Vec<u8>,
    string_offsets: HashMap<String, u32>,
}

impl FdtBuilder {
    pub fn new() -> Self {
        Self {
            structure: vec![],
            strings: vec![],
            string_offsets: HashMap::new(),
        }
    }

    pub fn begin_node(&mut self, name: &str) -> &mut Self {
        self.push_u32(FDT_BEGIN_NODE);
        self.structure.extend_from_slice(name.as_bytes());
        self.structure.push(0);
        self.pad();
        self
    }

    pub fn end_node(&mut self) -> &mut Self {
        self.push_u32(FDT_END_NODE);
        self
    }

    pub fn prop(&mut self, name: &str, value: &[u8]) -> &mut Self {
        let name_off = self.string_offset(name);
        self.push_u32(FDT_PROP);
        self.push_u32(value.len() as u32);
        self.push_u32(name_off);
        self.structure.extend_from_slice(value);
        self.pad();
        self
    }

    pub fn prop_cells(&mut self, name: &str, cells: &[u32]) -> &mut Self {
        let mut value = vec![];
        for cell in cells {
            value.extend_from_slice(&cell.to_be_bytes());
        }
        self.prop(name, &value)
    }

    pub fn prop_str(&mut self, name: &str, value: &str) -> &mut Self {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        self.prop(name, &bytes)
    }

    pub fn build(&mut self) -> Vec<u8> {
        self.push_u32(FDT_END);
        let struct_len = self.structure.len();
        let strings_off = STRUCT_OFFSET + struct_len;
        let totalsize = strings_off + self.strings.len();

        let mut out = vec![];
        for field in [
            FDT_MAGIC,
            totalsize as u32,
            STRUCT_OFFSET as u32,
            strings_off as u32,
            DTB_HEADER_LEN as u32, // off_mem_rsvmap
            17,                    // version
            16,                    // last_comp_version
            0,                     // boot_cpuid_phys
            self.strings.len() as u32,
            struct_len as u32,
        ] {
            out.extend_from_slice(&field.to_be_bytes());
        }
        out.extend_from_slice(&[0u8; MEMRSV_LEN]);
        out.extend_from_slice(&self.structure);
        out.extend_from_slice(&self.strings);
        out
    }

    fn push_u32(&mut self, value: u32) {
        self.structure.extend_from_slice(&value.to_be_bytes());
    }

    fn pad(&mut self) {
        while self.structure.len() % 4 != 0 {
            self.structure.push(0);
        }
    }

    fn string_offset(&mut self, name: &str) -> u32 {
        if let Some(&off) = self.string_offsets.get(name) {
            return off;
        }
        let off = self.strings.len() as u32;
        self.strings.extend_from_slice(name.as_bytes());
        self.strings.push(0);
        self.string_offsets.insert(name.to_string(), off);
        off
    }
}

/// A DTB holding `/leds/<name>` nodes with 3-cell gpios triplets.
pub fn leds_dtb(leds: &[(&str, [u32; 3])]) -> Vec<u8> {
    let mut b = FdtBuilder::new();
    b.begin_node("");
    b.begin_node("leds");
    for (name, cells) in leds {
        b.begin_node(name);
        b.prop_cells("gpios", cells);
        b.end_node();
    }
    b.end_node();
    b.end_node();
    b.build()
}

/// A DTB without any LED nodes.
pub fn plain_dtb() -> Vec<u8> {
    let mut b = FdtBuilder::new();
    b.begin_node("");
    b.prop_str("model", "plain-board");
    b.begin_node("chosen");
    b.prop_str("bootargs", "console=ttyS0");
    b.end_node();
    b.end_node();
    b.build()
}

/// An outer FIT DTB whose hash nodes hold `inner`'s digests, followed by
/// the inner blob itself, the way firmware images embed both.
pub fn fit_wrapping(inner: &[u8]) -> Vec<u8> {
    let mut b = FdtBuilder::new();
    b.begin_node("");
    b.prop_str("description", "firmware image");
    b.begin_node("images");
    b.begin_node("fdt-1");
    b.prop_str("description", "device tree");
    b.begin_node("hash-1");
    b.prop_str("algo", "crc32");
    b.prop("value", &crc32_be(inner));
    b.end_node();
    b.begin_node("hash-2");
    b.prop_str("algo", "sha1");
    b.prop("value", &sha1(inner));
    b.end_node();
    b.end_node();
    b.end_node();
    b.begin_node("configurations");
    b.prop_str("default", "config-1");
    b.begin_node("config-1");
    b.prop_str("fdt", "fdt-1");
    b.end_node();
    b.end_node();
    b.end_node();

    let mut image = b.build();
    while image.len() % 4 != 0 {
        image.push(0);
    }
    image.extend_from_slice(inner);
    image
}
