//! Key material loading for the daemon.

use std::path::Path;

use anyhow::{bail, Context, Result};
use ed25519_dalek::VerifyingKey;
use tlog::{LogSigner, TrustedKeys};

pub fn load_signer(path: &Path) -> Result<LogSigner> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read signing key {}", path.display()))?;
    parse_signer(&text).with_context(|| format!("Bad signing key in {}", path.display()))
}

pub fn load_trusted_keys(path: &Path) -> Result<TrustedKeys> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read trusted keys {}", path.display()))?;
    parse_trusted_keys(&text).with_context(|| format!("Bad trusted keys in {}", path.display()))
}

/// A hex-encoded 32-byte Ed25519 seed.
pub fn parse_signer(text: &str) -> Result<LogSigner> {
    let seed = decode_32(text.trim())?;
    Ok(LogSigner::from_seed(&seed))
}

/// One hex verifying key per line; blank lines and `#` comments are skipped.
pub fn parse_trusted_keys(text: &str) -> Result<TrustedKeys> {
    let mut keys = TrustedKeys::new();
    for (n, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let bytes = decode_32(line).with_context(|| format!("line {}", n + 1))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .with_context(|| format!("line {}: not an Ed25519 public key", n + 1))?;
        keys.insert(key);
    }
    if keys.is_empty() {
        bail!("no trusted submitter keys configured");
    }
    Ok(keys)
}

fn decode_32(s: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(s).context("not valid hex")?;
    match <[u8; 32]>::try_from(bytes.as_slice()) {
        Ok(arr) => Ok(arr),
        Err(_) => bail!("expected 32 bytes, got {}", bytes.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    #[test]
    fn signer_from_hex_seed() {
        let seed = [3u8; 32];
        let signer = parse_signer(&format!("{}\n", hex::encode(seed))).unwrap();
        assert_eq!(signer.verifying_key(), SigningKey::from_bytes(&seed).verifying_key());
        assert!(parse_signer("abcd").is_err());
    }

    #[test]
    fn trusted_keys_file() {
        let a = SigningKey::generate(&mut OsRng).verifying_key();
        let b = SigningKey::generate(&mut OsRng).verifying_key();
        let text = format!(
            "# ci builders\n{}\n\n{}  # release key\n",
            hex::encode(a.as_bytes()),
            hex::encode(b.as_bytes())
        );
        let keys = parse_trusted_keys(&text).unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys.get(&tlog::key_id(&a)), Some(&a));

        assert!(parse_trusted_keys("# nothing here\n").is_err());
        assert!(parse_trusted_keys("zz\n").is_err());
    }
}
