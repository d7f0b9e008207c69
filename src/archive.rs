use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::info;

use crate::config::ArchiveSettings;
use crate::domain::LayerStatus;
use crate::error::HarvestError;
use crate::store::{Store, fs_error};

/// Hook run on a layer artifact whenever its status file already exists and
/// again right after a download finishes.
pub trait PostProcess {
    /// `true` means the layer needs nothing more in this run.
    fn post_process(&self, artifact: &Utf8Path, status: &Utf8Path) -> Result<bool, HarvestError>;
}

/// Treats a downloaded layer as finished.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPostProcess;

impl PostProcess for NoPostProcess {
    fn post_process(&self, _artifact: &Utf8Path, status: &Utf8Path) -> Result<bool, HarvestError> {
        Ok(matches!(
            Store::read_status(status)?,
            Some(
                LayerStatus::Downloaded
                    | LayerStatus::Compressed
                    | LayerStatus::Done
                    | LayerStatus::NotLayer
                    | LayerStatus::RasterLayer
                    | LayerStatus::Ignore
            )
        ))
    }
}

/// Compresses finished artifacts with 7z and uploads them with gsutil,
/// walking the status through `downloaded -> compressed -> done`.
#[derive(Debug, Clone)]
pub struct ArchiveTransfer {
    data_root: Utf8PathBuf,
    bucket: String,
    compressor: Option<PathBuf>,
    uploader: Option<PathBuf>,
}

impl ArchiveTransfer {
    pub fn new(data_root: &Utf8Path, settings: &ArchiveSettings) -> Self {
        Self {
            data_root: data_root.to_path_buf(),
            bucket: settings.bucket.clone(),
            compressor: find_in_path(&settings.compressor),
            uploader: find_in_path(&settings.uploader),
        }
    }

    pub fn archive_path(artifact: &Utf8Path) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{artifact}.7z"))
    }

    /// `gs://<bucket>/<path below the data root>.7z`
    pub fn remote_url(&self, artifact: &Utf8Path) -> String {
        let archive = Self::archive_path(artifact);
        let relative = archive
            .strip_prefix(&self.data_root)
            .map(Utf8Path::to_path_buf)
            .unwrap_or(archive);
        format!("gs://{}/{}", self.bucket, relative)
    }

    fn compress(&self, artifact: &Utf8Path, status: &Utf8Path) -> Result<(), HarvestError> {
        let archive = Self::archive_path(artifact);
        if !archive.as_std_path().exists() {
            let program = self
                .compressor
                .as_ref()
                .ok_or_else(|| HarvestError::MissingTool("7z".to_string()))?;
            let args = vec![
                "a".to_string(),
                "-m0=PPMd".to_string(),
                archive.to_string(),
                artifact.to_string(),
            ];
            run_cmd(program, &args)?;
            fs::remove_file(artifact.as_std_path()).map_err(|err| fs_error(artifact, err))?;
        }
        Store::write_status(status, LayerStatus::Compressed)
    }

    fn transfer(&self, artifact: &Utf8Path, status: &Utf8Path) -> Result<(), HarvestError> {
        let archive = Self::archive_path(artifact);
        if archive.as_std_path().exists() {
            let program = self
                .uploader
                .as_ref()
                .ok_or_else(|| HarvestError::MissingTool("gsutil".to_string()))?;
            let args = vec![
                "-m".to_string(),
                "cp".to_string(),
                archive.to_string(),
                self.remote_url(artifact),
            ];
            run_cmd(program, &args)?;
            fs::remove_file(archive.as_std_path()).map_err(|err| fs_error(&archive, err))?;
        }
        Store::write_status(status, LayerStatus::Done)
    }
}

impl PostProcess for ArchiveTransfer {
    fn post_process(&self, artifact: &Utf8Path, status: &Utf8Path) -> Result<bool, HarvestError> {
        if Store::read_status(status)? == Some(LayerStatus::Downloaded) {
            self.compress(artifact, status)?;
        }
        if Store::read_status(status)? == Some(LayerStatus::Compressed) {
            self.transfer(artifact, status)?;
        }
        Ok(matches!(
            Store::read_status(status)?,
            Some(
                LayerStatus::Done
                    | LayerStatus::NotLayer
                    | LayerStatus::RasterLayer
                    | LayerStatus::Ignore
            )
        ))
    }
}

fn run_cmd(program: &Path, args: &[String]) -> Result<(), HarvestError> {
    info!(program = %program.display(), args = ?args, "running command");
    let start = Instant::now();
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|err| HarvestError::PostProcess(err.to_string()))?;
    info!(
        secs = start.elapsed().as_secs_f64(),
        stdout = %String::from_utf8_lossy(&output.stdout).trim(),
        "command finished"
    );
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let message = if stderr.is_empty() {
        format!("command failed: {}", program.display())
    } else {
        stderr
    };
    Err(HarvestError::PostProcess(message))
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return candidate.exists().then(|| candidate.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}
