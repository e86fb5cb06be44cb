//! Host disk provisioning: optional image checksum, then a raw write with
//! `qemu-img convert`.

use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::info;

use super::runner::{run_checked, CommandRunner, Invocation};
use crate::config::DiskConfig;
use crate::hardware::{provision_payload, BackendError, BackendResult, CancelSignal, DiskImage};

const READ_CHUNK: usize = 1024 * 1024;

pub struct ImageWriter {
    runner: Arc<dyn CommandRunner>,
    config: DiskConfig,
}

impl ImageWriter {
    pub fn new(runner: Arc<dyn CommandRunner>, config: DiskConfig) -> Self {
        Self { runner, config }
    }

    pub async fn provision(&self, image: &DiskImage, cancel: &CancelSignal) -> BackendResult {
        if let Some(expected) = &image.sha256 {
            verify_checksum(&image.image, expected, cancel).await?;
        }

        let invocation = Invocation::new(&self.config.writer).args([
            "convert",
            "-O",
            "raw",
            image.image.as_str(),
            self.config.device.as_str(),
        ]);
        run_checked(self.runner.as_ref(), &invocation, cancel).await?;

        info!(image = %image.image, device = %self.config.device, "disk provisioned");
        Ok(provision_payload(image, &self.config.device))
    }
}

async fn verify_checksum(path: &str, expected: &str, cancel: &CancelSignal) -> Result<(), BackendError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| BackendError::fault(format!("cannot open image {path}: {e}")))?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        if cancel.is_cancelled() {
            return Err(BackendError::fault("checksum verification cancelled"));
        }
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| BackendError::fault(format!("cannot read image {path}: {e}")))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    let actual = hex::encode(hasher.finalize());
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(BackendError::fault(format!(
            "image checksum mismatch: expected {expected}, got {actual}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::real::runner::testing::ScriptedRunner;
    use crate::hardware::BackendErrorKind;
    use std::io::Write;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    fn image_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello").unwrap();
        file
    }

    fn writer(runner: Arc<ScriptedRunner>) -> ImageWriter {
        ImageWriter::new(
            runner,
            DiskConfig {
                writer: "qemu-img".into(),
                device: "/dev/nvme0n1".into(),
            },
        )
    }

    #[tokio::test]
    async fn verified_image_is_written_raw() {
        let file = image_file();
        let path = file.path().to_string_lossy().into_owned();
        let runner = Arc::new(ScriptedRunner::succeeding());

        let payload = writer(runner.clone())
            .provision(
                &DiskImage {
                    image: path.clone(),
                    sha256: Some(HELLO_SHA256.to_uppercase()),
                },
                &CancelSignal::never(),
            )
            .await
            .unwrap();

        assert_eq!(payload["verified"], true);
        assert_eq!(payload["device"], "/dev/nvme0n1");
        assert_eq!(
            runner.command_lines(),
            vec![format!("qemu-img convert -O raw {path} /dev/nvme0n1")]
        );
    }

    #[tokio::test]
    async fn checksum_mismatch_never_touches_the_disk() {
        let file = image_file();
        let runner = Arc::new(ScriptedRunner::succeeding());

        let err = writer(runner.clone())
            .provision(
                &DiskImage {
                    image: file.path().to_string_lossy().into_owned(),
                    sha256: Some("00".repeat(32)),
                },
                &CancelSignal::never(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind, BackendErrorKind::HardwareFault);
        assert!(err.message.contains("checksum mismatch"));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn missing_image_is_a_fault() {
        let runner = Arc::new(ScriptedRunner::succeeding());
        let err = writer(runner)
            .provision(
                &DiskImage {
                    image: "/nonexistent/image.qcow2".into(),
                    sha256: Some(HELLO_SHA256.into()),
                },
                &CancelSignal::never(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::HardwareFault);
    }
}
