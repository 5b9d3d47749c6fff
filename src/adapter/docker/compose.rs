//! Tar helpers for container archive copy, and thin `docker compose`
//! subprocess wrappers.
//!
//! Compose subcommands shell out directly rather than going through the
//! engine's adapters: they remain thin wrappers that do not participate
//! in the engine's retry/timeout policy.

use crate::errors::{XecError, XecResult};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command as TokioCommand;

/// Tar up `path` (file or directory) into an in-memory archive suitable for
/// `PUT /containers/{id}/archive`, gzip-compressed.
pub fn tar_path(path: &Path) -> XecResult<(Vec<u8>, u64)> {
    let mut total = 0u64;
    let buf = Vec::new();
    let enc = flate2::write::GzEncoder::new(buf, flate2::Compression::default());
    let mut builder = tar::Builder::new(enc);
    if path.is_dir() {
        for entry in walkdir::WalkDir::new(path) {
            let entry = entry.map_err(|e| XecError::SftpError { path: path.display().to_string(), reason: e.to_string() })?;
            let rel = entry.path().strip_prefix(path).unwrap_or(entry.path());
            if rel.as_os_str().is_empty() {
                continue;
            }
            if entry.file_type().is_file() {
                total += entry.metadata().map(|m| m.len()).unwrap_or(0);
                builder.append_path_with_name(entry.path(), rel)?;
            } else if entry.file_type().is_dir() {
                builder.append_dir(rel, entry.path())?;
            }
        }
    } else {
        total = std::fs::metadata(path)?.len();
        let name = path.file_name().ok_or_else(|| XecError::SftpError {
            path: path.display().to_string(),
            reason: "path has no file name".to_string(),
        })?;
        builder.append_path_with_name(path, name)?;
    }
    let enc = builder
        .into_inner()
        .map_err(|e| XecError::SftpError { path: path.display().to_string(), reason: e.to_string() })?;
    let compressed = enc
        .finish()
        .map_err(|e| XecError::SftpError { path: path.display().to_string(), reason: e.to_string() })?;
    Ok((compressed, total))
}

/// Extract a (possibly gzip-compressed) tar archive into `dst`.
pub fn untar_to(archive: &[u8], dst: &Path) -> XecResult<()> {
    std::fs::create_dir_all(dst)?;
    // The daemon's `GET .../archive` response is an uncompressed tar; accept
    // gzip transparently too since `tar_path` produces gzip for uploads.
    if archive.len() >= 2 && archive[0] == 0x1f && archive[1] == 0x8b {
        let dec = flate2::read::GzDecoder::new(archive);
        let mut unpacker = tar::Archive::new(dec);
        unpacker
            .unpack(dst)
            .map_err(|e| XecError::SftpError { path: dst.display().to_string(), reason: e.to_string() })
    } else {
        let mut unpacker = tar::Archive::new(archive);
        unpacker
            .unpack(dst)
            .map_err(|e| XecError::SftpError { path: dst.display().to_string(), reason: e.to_string() })
    }
}

/// Thin wrapper over `docker compose`; each call spawns a fresh subprocess
/// and reports its own `CommandFailed` rather than going through an adapter
///.
#[derive(Debug, Clone)]
pub struct ComposeRunner {
    /// Compose files to pass as repeated `-f`.
    pub files: Vec<PathBuf>,
    /// `-p`/`--project-name`, if set.
    pub project_name: Option<String>,
}

impl ComposeRunner {
    fn base_args(&self) -> Vec<String> {
        let mut args = vec!["compose".to_string()];
        for f in &self.files {
            args.push("-f".to_string());
            args.push(f.display().to_string());
        }
        if let Some(name) = &self.project_name {
            args.push("-p".to_string());
            args.push(name.clone());
        }
        args
    }

    async fn run(&self, mut args: Vec<String>) -> XecResult<String> {
        let mut full = self.base_args();
        full.append(&mut args);
        let output = TokioCommand::new("docker")
            .args(&full)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| XecError::SpawnFailed { program: "docker".to_string(), reason: e.to_string() })?;
        if !output.status.success() {
            return Err(XecError::CommandFailed {
                command: format!("docker {}", full.join(" ")),
                exit_code: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// `docker compose up -d`.
    pub async fn up(&self, detached: bool) -> XecResult<String> {
        let mut args = vec!["up".to_string()];
        if detached {
            args.push("-d".to_string());
        }
        self.run(args).await
    }

    /// `docker compose down`.
    pub async fn down(&self) -> XecResult<String> {
        self.run(vec!["down".to_string()]).await
    }

    /// `docker compose ps --format json`.
    pub async fn ps(&self) -> XecResult<String> {
        self.run(vec!["ps".to_string(), "--format".to_string(), "json".to_string()]).await
    }

    /// `docker compose logs`.
    pub async fn logs(&self, follow: bool) -> XecResult<String> {
        let mut args = vec!["logs".to_string()];
        if follow {
            args.push("-f".to_string());
        }
        self.run(args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tar_then_untar_round_trips_a_single_file() {
        let src_dir = tempfile::tempdir().unwrap();
        let file = src_dir.path().join("hello.txt");
        std::fs::write(&file, b"hello from xec").unwrap();

        let (archive, total) = tar_path(&file).unwrap();
        assert_eq!(total, "hello from xec".len() as u64);

        let dst_dir = tempfile::tempdir().unwrap();
        untar_to(&archive, dst_dir.path()).unwrap();
        let roundtripped = std::fs::read(dst_dir.path().join("hello.txt")).unwrap();
        assert_eq!(roundtripped, b"hello from xec");
    }

    #[test]
    fn tar_then_untar_round_trips_a_directory_tree() {
        let src_dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src_dir.path().join("nested")).unwrap();
        std::fs::write(src_dir.path().join("nested/a.txt"), b"a").unwrap();
        std::fs::write(src_dir.path().join("b.txt"), b"bb").unwrap();

        let (archive, total) = tar_path(src_dir.path()).unwrap();
        assert_eq!(total, 3);

        let dst_dir = tempfile::tempdir().unwrap();
        untar_to(&archive, dst_dir.path()).unwrap();
        assert_eq!(std::fs::read(dst_dir.path().join("nested/a.txt")).unwrap(), b"a");
        assert_eq!(std::fs::read(dst_dir.path().join("b.txt")).unwrap(), b"bb");
    }

    #[test]
    fn base_args_includes_files_and_project_name() {
        let runner = ComposeRunner {
            files: vec![PathBuf::from("docker-compose.yml"), PathBuf::from("docker-compose.override.yml")],
            project_name: Some("xec-demo".to_string()),
        };
        assert_eq!(
            runner.base_args(),
            vec!["compose", "-f", "docker-compose.yml", "-f", "docker-compose.override.yml", "-p", "xec-demo"]
        );
    }

    #[test]
    fn base_args_omits_project_name_when_unset() {
        let runner = ComposeRunner { files: vec![], project_name: None };
        assert_eq!(runner.base_args(), vec!["compose"]);
    }
}
