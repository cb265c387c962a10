//! Primary barcode decoding via the `zbarimg` CLI.
//!
//! The decoder is a seam: stage handlers depend on [`PrimaryDecoder`], the
//! production implementation shells out to ZBar, and tests script results.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use uuid::Uuid;

use crate::services::barcode::BarcodeSymbology;

/// A raw code as reported by the local decoder, before validation.
#[derive(Debug, Clone)]
pub struct RawDecode {
    pub code: String,
    pub symbology: Option<BarcodeSymbology>,
}

/// Deterministic local barcode recognizer.
#[async_trait]
pub trait PrimaryDecoder: Send + Sync {
    /// Name recorded in decoder-attempt history (`zbar`, `zxing`, …).
    fn name(&self) -> &'static str;

    async fn decode(&self, image: &[u8]) -> Result<Vec<RawDecode>, DecodeError>;
}

/// `zbarimg` invocation restricted to the EAN/UPC symbologies.
pub struct ZbarCli {
    binary: String,
}

impl ZbarCli {
    pub fn new() -> Self {
        Self {
            binary: "zbarimg".to_string(),
        }
    }
}

impl Default for ZbarCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PrimaryDecoder for ZbarCli {
    fn name(&self) -> &'static str {
        "zbar"
    }

    async fn decode(&self, image: &[u8]) -> Result<Vec<RawDecode>, DecodeError> {
        // zbarimg only reads files; stage the image in a scratch path.
        let scratch: PathBuf =
            std::env::temp_dir().join(format!("ean-extract-{}.img", Uuid::new_v4().simple()));
        tokio::fs::write(&scratch, image)
            .await
            .map_err(|e| DecodeError::Io(e.to_string()))?;

        let output = Command::new(&self.binary)
            .args([
                "--quiet",
                "-Sdisable",
                "-Sean13.enable",
                "-Sean8.enable",
                "-Supca.enable",
                "-Supce.enable",
            ])
            .arg(&scratch)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await;

        tokio::fs::remove_file(&scratch).await.ok();

        let output = output.map_err(|e| DecodeError::Spawn(e.to_string()))?;

        // zbarimg exits 4 when no symbol was found; that is a normal outcome.
        match output.status.code() {
            Some(0) | Some(4) => {}
            code => {
                return Err(DecodeError::Decoder(format!(
                    "zbarimg exited with {code:?}"
                )));
            }
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_zbar_output(&stdout))
    }
}

/// Parse `TYPE:data` lines from zbarimg output.
fn parse_zbar_output(stdout: &str) -> Vec<RawDecode> {
    stdout
        .lines()
        .filter_map(|line| {
            let (symbol, data) = line.trim().split_once(':')?;
            let symbology = match symbol {
                "EAN-13" => Some(BarcodeSymbology::Ean13),
                "EAN-8" => Some(BarcodeSymbology::Ean8),
                "UPC-A" => Some(BarcodeSymbology::UpcA),
                "UPC-E" => Some(BarcodeSymbology::UpcE),
                _ => None,
            };
            Some(RawDecode {
                code: data.trim().to_string(),
                symbology,
            })
        })
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("failed to spawn decoder: {0}")]
    Spawn(String),

    #[error("decoder I/O error: {0}")]
    Io(String),

    #[error("decoder failed: {0}")]
    Decoder(String),
}
