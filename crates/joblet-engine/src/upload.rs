//! Implementation of the upload pipe.
//!
//! Client file uploads are streamed through named pipes (FIFOs) so the
//! daemon never buffers entire files in memory. The job manager creates
//! one FIFO per upload descriptor before the sandbox child is spawned; the
//! transport writes client bytes into the FIFO as they arrive, and the
//! sandbox init process reads each FIFO and materialises its contents at
//! the declared destination before the user command is exec'ed.
//!
//! Back-pressure is inherent: a stalled client blocks the FIFO write,
//! which blocks the materialiser, which delays exec.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use joblet_core::UploadSpec;

/// The directory inside the sandbox where the pipes directory is
/// bind-mounted, parameterised by job id (`/pipes/<job-id>`).
pub const SANDBOX_PIPES_DIR: &str = "/pipes";

/// The working directory inside the sandbox that relative upload
/// destinations resolve against.
pub const SANDBOX_WORK_DIR: &str = "/work";

/// Creates the FIFO for every upload descriptor of a job.
///
/// The pipes directory is created if needed. FIFOs are mode `0600`: only
/// the daemon (and the sandbox, which sees them via a bind mount) may
/// touch them.
pub fn create_pipes(pipes_dir: &Path, uploads: &[UploadSpec]) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(pipes_dir).with_context(|| {
        format!(
            "failed to create pipes directory `{path}`",
            path = pipes_dir.display()
        )
    })?;

    let mut pipes = Vec::with_capacity(uploads.len());
    for upload in uploads {
        let path = pipes_dir.join(upload.fifo_name());
        mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR).with_context(|| {
            format!("failed to create upload FIFO `{path}`", path = path.display())
        })?;

        debug!(pipe = %path.display(), size = upload.size, "created upload FIFO");
        pipes.push(path);
    }

    Ok(pipes)
}

/// Resolves an upload's destination path inside the sandbox.
///
/// Absolute destinations are used as-is; relative destinations resolve
/// against the sandbox working directory.
pub fn destination_in_sandbox(upload: &UploadSpec) -> PathBuf {
    if upload.destination.is_absolute() {
        upload.destination.clone()
    } else {
        Path::new(SANDBOX_WORK_DIR).join(&upload.destination)
    }
}

/// A transport-side writer streaming one upload's bytes into its FIFO.
///
/// Opening the write end blocks until the sandbox init process opens the
/// read end, so the open is performed on the blocking pool.
#[derive(Debug)]
pub struct UploadSink {
    /// The open FIFO.
    file: tokio::fs::File,
    /// The FIFO path, for diagnostics.
    path: PathBuf,
}

impl UploadSink {
    /// Opens the write end of an upload FIFO.
    pub async fn open(path: PathBuf) -> Result<Self> {
        let std_file = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || fs::OpenOptions::new().write(true).open(path))
                .await
                .context("upload FIFO open task failed")??
        };

        Ok(Self {
            file: tokio::fs::File::from_std(std_file),
            path,
        })
    }

    /// Writes one chunk of client bytes into the FIFO.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.file.write_all(chunk).await.with_context(|| {
            format!(
                "failed to write upload chunk to `{path}`",
                path = self.path.display()
            )
        })
    }

    /// Finishes the upload, closing the FIFO so the materialiser sees EOF.
    pub async fn finish(mut self) -> Result<()> {
        self.file.flush().await.with_context(|| {
            format!("failed to flush upload FIFO `{path}`", path = self.path.display())
        })
    }
}

/// Materialises every upload of a job from its FIFO to its destination.
///
/// This runs inside the sandbox init process after the filesystem is
/// constructed: `pipes_dir` is the bind-mounted pipes directory and
/// destinations are sandbox-absolute paths. Reads block until the
/// transport writes the corresponding bytes, which is what delays exec
/// until every upload has fully arrived.
pub fn materialise_uploads(pipes_dir: &Path, uploads: &[UploadSpec]) -> io::Result<()> {
    for upload in uploads {
        let pipe = pipes_dir.join(upload.fifo_name());
        let destination = destination_in_sandbox(upload);

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut reader = fs::File::open(&pipe)?;
        let mut writer = fs::File::create(&destination)?;
        io::copy(&mut reader, &mut writer)?;
        fs::set_permissions(&destination, fs::Permissions::from_mode(upload.mode))?;
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    use pretty_assertions::assert_eq;

    use super::*;

    /// Builds an upload spec for the given index and destination.
    fn upload(index: usize, destination: &str, mode: u32, size: u64) -> UploadSpec {
        UploadSpec {
            index,
            destination: PathBuf::from(destination),
            mode,
            size,
        }
    }

    #[test]
    fn destinations_resolve_against_the_work_dir() {
        assert_eq!(
            destination_in_sandbox(&upload(0, "input.txt", 0o644, 1)),
            PathBuf::from("/work/input.txt")
        );
        assert_eq!(
            destination_in_sandbox(&upload(0, "/tmp/x", 0o644, 1)),
            PathBuf::from("/tmp/x")
        );
    }

    #[test]
    fn pipes_are_created_per_upload() {
        let dir = tempfile::tempdir().unwrap();
        let uploads = vec![upload(0, "a", 0o644, 1), upload(1, "b", 0o644, 1)];
        let pipes = create_pipes(dir.path(), &uploads).unwrap();
        assert_eq!(pipes.len(), 2);
        assert!(pipes[0].ends_with("0"));
        assert!(pipes[1].ends_with("1"));
    }

    #[test]
    fn materialises_bytes_and_mode() {
        let pipes_dir = tempfile::tempdir().unwrap();
        let dest_dir = tempfile::tempdir().unwrap();

        let destination = dest_dir.path().join("script.sh");
        let uploads = vec![upload(
            0,
            destination.to_str().unwrap(),
            0o755,
            11,
        )];
        let pipes = create_pipes(pipes_dir.path(), &uploads).unwrap();

        // The writer must be concurrent: opening a FIFO for reading blocks
        // until a writer appears.
        let pipe = pipes[0].clone();
        let writer = std::thread::spawn(move || {
            let mut fifo = fs::OpenOptions::new().write(true).open(pipe).unwrap();
            fifo.write_all(b"#!/bin/sh\n\n").unwrap();
        });

        materialise_uploads(pipes_dir.path(), &uploads).unwrap();
        writer.join().unwrap();

        assert_eq!(fs::read(&destination).unwrap(), b"#!/bin/sh\n\n");
        let mode = fs::metadata(&destination).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn zero_byte_upload_creates_an_empty_destination() {
        let pipes_dir = tempfile::tempdir().unwrap();
        let dest_dir = tempfile::tempdir().unwrap();

        let destination = dest_dir.path().join("empty");
        let uploads = vec![upload(0, destination.to_str().unwrap(), 0o644, 0)];
        let pipes = create_pipes(pipes_dir.path(), &uploads).unwrap();

        let pipe = pipes[0].clone();
        let writer = std::thread::spawn(move || {
            // Open and immediately close: EOF with no bytes.
            let _ = fs::OpenOptions::new().write(true).open(pipe).unwrap();
        });

        materialise_uploads(pipes_dir.path(), &uploads).unwrap();
        writer.join().unwrap();

        assert!(destination.exists());
        assert_eq!(fs::metadata(&destination).unwrap().len(), 0);
    }
}
