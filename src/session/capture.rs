use anyhow::{Context, Result};
use tokio::process::Command as TokioCommand;
use tracing::debug;

/// Grab one frame with an external command. `{}` in the template is replaced
/// with the output path, e.g. `fswebcam --no-banner {}`.
pub async fn capture_with_command(template: &str) -> Result<Vec<u8>> {
    let dir = tempfile::Builder::new()
        .prefix("pixelsense-capture-")
        .tempdir()?;
    let path = dir.path().join("frame.jpg");
    let path_str = path.to_str().context("Invalid capture path")?;
    let command = template.replace("{}", path_str);
    debug!("Running capture command: {}", command);

    let output = TokioCommand::new("sh")
        .arg("-c")
        .arg(&command)
        .output()
        .await
        .context("Failed to run capture command")?;
    if !output.status.success() {
        let err = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("Capture command failed: {}", err.trim());
    }

    let bytes = tokio::fs::read(&path)
        .await
        .context("Capture command did not write an image")?;
    if bytes.is_empty() {
        anyhow::bail!("Capture command wrote an empty file");
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_written_file() {
        let bytes = capture_with_command("printf frame > {}").await.unwrap();
        assert_eq!(bytes, b"frame");
    }

    #[tokio::test]
    async fn test_missing_output_is_error() {
        let err = capture_with_command("true {}").await.unwrap_err();
        assert!(err.to_string().contains("did not write"));
    }
}
