//! Builds patch archives

use crate::delta;
use crate::error::UpliftError;
use std::io::{Seek, Write};
use tracing::debug;
use uplift_types::PatchAction;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Writes Create, Patch and Delete entries into a zip archive
pub struct PatchWriter<W: Write + Seek> {
    zip: ZipWriter<W>,
    options: SimpleFileOptions,
}

impl<W: Write + Seek> PatchWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            zip: ZipWriter::new(inner),
            options: SimpleFileOptions::default().compression_method(CompressionMethod::Deflated),
        }
    }

    /// Store following entries uncompressed
    pub fn set_stored(&mut self) {
        self.options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    }

    /// Ship `contents` as the new version of `relative_path`
    pub fn add_create(&mut self, relative_path: &str, contents: &[u8]) -> Result<(), UpliftError> {
        self.add_action(relative_path, PatchAction::Create, contents)
    }

    /// Ship a delta that turns `old` into `new` at `relative_path`
    pub fn add_patch(&mut self, relative_path: &str, old: &[u8], new: &[u8]) -> Result<(), UpliftError> {
        let delta = delta::diff(old, new);
        debug!(
            "Delta for {}: {} bytes for a {} byte file",
            relative_path,
            delta.len(),
            new.len()
        );
        self.add_action(relative_path, PatchAction::Patch, &delta)
    }

    /// Remove `relative_path` from the application directory
    pub fn add_delete(&mut self, relative_path: &str) -> Result<(), UpliftError> {
        self.add_action(relative_path, PatchAction::Delete, &[])
    }

    /// Write an entry under an arbitrary name
    pub fn add_raw(&mut self, name: &str, contents: &[u8]) -> Result<(), UpliftError> {
        self.zip.start_file(name, self.options)?;
        self.zip.write_all(contents)?;
        Ok(())
    }

    /// Write the central directory and hand back the underlying writer
    pub fn finish(self) -> Result<W, UpliftError> {
        Ok(self.zip.finish()?)
    }

    fn add_action(&mut self, relative_path: &str, action: PatchAction, contents: &[u8]) -> Result<(), UpliftError> {
        if relative_path.is_empty() {
            return Err(UpliftError::InvalidOperation("empty patch entry path".to_string()));
        }
        self.add_raw(&format!("{}{}", relative_path, action.suffix()), contents)
    }
}
