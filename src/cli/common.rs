use anyhow::{Context, Result};
use std::path::PathBuf;

use pixelsense::config::Config;
use pixelsense::pipeline::Pipeline;
use pixelsense::session::{HttpBackend, ImageService};

/// The backend client, or the in-process pipeline when `local` is set.
pub fn make_service(config: &Config, local: bool) -> Result<Box<dyn ImageService>> {
    if local {
        Ok(Box::new(Pipeline::from_config(config)?))
    } else {
        Ok(Box::new(HttpBackend::new(&config.client)?))
    }
}

pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path.trim()).to_string())
}

pub async fn read_file(path: &str) -> Result<(Vec<u8>, String)> {
    let path = expand_path(path);
    let bytes = tokio::fs::read(&path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file")
        .to_string();
    Ok((bytes, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_file_returns_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cat.jpg");
        std::fs::write(&path, b"meow").unwrap();

        let (bytes, name) = read_file(path.to_str().unwrap()).await.unwrap();
        assert_eq!(bytes, b"meow");
        assert_eq!(name, "cat.jpg");
        assert!(read_file("/definitely/not/here.png").await.is_err());
    }
}
