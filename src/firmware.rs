use anyhow::{bail, ensure, Context, Result};
use std::path::Path;

/// One whole firmware image held in memory. This is the only thing the
/// patcher ever mutates or writes out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Firmware(pub Vec<u8>);

impl std::ops::Deref for Firmware {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::ops::DerefMut for Firmware {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Firmware {
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self(data)
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self(std::fs::read(path)?))
    }

    /// Write the image to `path`, refusing a path that resolves to
    /// `input_path`. The check runs before any byte hits the disk.
    pub fn write(&self, path: impl AsRef<Path>, input_path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let input_path = input_path.as_ref();
        if path.exists() {
            let out = path
                .canonicalize()
                .with_context(|| format!("Could not resolve output path {}", path.display()))?;
            let input = input_path.canonicalize().with_context(|| {
                format!("Could not resolve input path {}", input_path.display())
            })?;
            if out == input {
                bail!("Refusing to overwrite input file {}", input_path.display());
            }
        }
        std::fs::write(path, &self.0).with_context(|| format!("Could not write {}", path.display()))
    }

    /// Big-endian u32 at `offset`; fails on out-of-bounds.
    pub fn read_be32(&self, offset: usize) -> Result<u32> {
        let bytes = self
            .0
            .get(offset..offset + 4)
            .with_context(|| format!("Read past end of image at {offset:#x}"))?;
        Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
    }

    /// Overwrite the 4 bytes at `offset` with `value` big-endian.
    pub fn write_be32(&mut self, offset: usize, value: u32) -> Result<()> {
        ensure!(
            offset + 4 <= self.0.len(),
            "Write past end of image at {offset:#x}"
        );
        self.0[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    /// Same-length overwrite of an arbitrary byte range.
    pub fn write_bytes(&mut self, offset: usize, value: &[u8]) -> Result<()> {
        ensure!(
            offset + value.len() <= self.0.len(),
            "Write past end of image at {offset:#x}"
        );
        self.0[offset..offset + value.len()].copy_from_slice(value);
        Ok(())
    }
}
