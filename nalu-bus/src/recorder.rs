use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::nalu::NalUnit;

/// Writes every received unit, start code included, to a raw `.h264` file
/// that plays back as an Annex-B stream.
pub struct RawRecorder {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    written: u64,
}

impl RawRecorder {
    /// Creates `dir` if needed and opens the first unused
    /// `recording_<n>.h264` inside it.
    pub fn create(dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = unused_filename(dir, "h264");
        let file = File::create(&path)?;
        log::info!("ground recording to {}", path.display());
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// A write error stops the recording for good; the stream itself is not
    /// affected.
    pub fn write(&mut self, unit: &NalUnit) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        match writer.write_all(unit.data()) {
            Ok(()) => self.written += unit.size() as u64,
            Err(e) => {
                log::error!("ground recording {} failed: {}", self.path.display(), e);
                self.writer = None;
            }
        }
    }

    pub fn finish(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                log::error!("flush ground recording {}: {}", self.path.display(), e);
            }
            if self.written == 0 {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    log::warn!("remove empty recording {}: {}", self.path.display(), e);
                }
                return;
            }
            log::info!(
                "ground recording {} closed, {} bytes",
                self.path.display(),
                self.written
            );
        }
    }
}

impl Drop for RawRecorder {
    fn drop(&mut self) {
        self.finish();
    }
}

fn unused_filename(dir: &Path, ext: &str) -> PathBuf {
    let mut index = 0u32;
    loop {
        let candidate = dir.join(format!("recording_{}.{}", index, ext));
        if !candidate.exists() {
            return candidate;
        }
        index += 1;
    }
}
