//! Local client commands: seal a file for upload, open a downloaded blob.
//! Keys are only ever printed to the local terminal.

use crate::envelope;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Encrypt `input` into `output`. Returns the encoded key.
pub async fn seal(input: &Path, output: &Path, name: Option<&str>) -> Result<String> {
    let name = match name {
        Some(name) => name.to_string(),
        None => input
            .file_name()
            .and_then(|n| n.to_str())
            .context("input path has no UTF-8 file name; pass --name")?
            .to_string(),
    };

    let body = fs::read(input)
        .await
        .with_context(|| format!("reading {}", input.display()))?;
    let (key, sealed) = envelope::seal_file(&name, &body)?;
    fs::write(output, &sealed)
        .await
        .with_context(|| format!("writing {}", output.display()))?;

    tracing::debug!(
        plaintext = body.len(),
        sealed = sealed.len(),
        "sealed {}",
        output.display()
    );
    Ok(key.encode())
}

/// Decrypt `input` with a key (or a full share link) and write the
/// embedded file into `output_dir`. Returns the path written.
pub async fn open(input: &Path, link_or_key: &str, output_dir: &Path) -> Result<PathBuf> {
    let key = envelope::key_from_link(link_or_key)?;
    let sealed = fs::read(input)
        .await
        .with_context(|| format!("reading {}", input.display()))?;
    let (name, body) = envelope::open_file(&key, &sealed)?;

    let target = output_dir.join(safe_file_name(&name));
    fs::write(&target, &body)
        .await
        .with_context(|| format!("writing {}", target.display()))?;
    Ok(target)
}

/// The embedded name is attacker-controlled: keep only its last path
/// component.
fn safe_file_name(name: &str) -> String {
    let last = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    match last {
        "" | "." | ".." => "download".to_string(),
        other => other.to_string(),
    }
}
