use anyhow::{anyhow, Context, Result};
use secrecy::SecretVec;
use std::io::Read;
use std::path::Path;
use zeroize::Zeroizing;

/// Reads x25519 identities from an age identity file. Blank lines and `#`
/// comments are skipped, as `age-keygen` writes them.
pub fn load_identities(path: &Path) -> Result<Vec<age::x25519::Identity>> {
    let text = Zeroizing::new(
        std::fs::read_to_string(path).with_context(|| format!("open identity {}", path.display()))?,
    );
    let ids = parse_identities(&text).with_context(|| format!("identity file {}", path.display()))?;
    if ids.is_empty() {
        anyhow::bail!("identity file {} holds no identities", path.display());
    }
    Ok(ids)
}

fn parse_identities(text: &str) -> Result<Vec<age::x25519::Identity>> {
    text.lines()
        .enumerate()
        .map(|(n, l)| (n + 1, l.trim()))
        .filter(|(_, l)| !l.is_empty() && !l.starts_with('#'))
        .map(|(n, l)| l.parse::<age::x25519::Identity>().map_err(|e| anyhow!("line {n}: {e}")))
        .collect()
}

pub fn decrypt_age_bytes(rdr: impl Read, ids: &[age::x25519::Identity]) -> Result<SecretVec<u8>> {
    let decryptor = age::Decryptor::new(rdr).context("not an age file")?;
    let mut plain = decryptor
        .decrypt(ids.iter().map(|i| i as &dyn age::Identity))
        .context("no identity matches this file")?;
    let mut out = Vec::new();
    plain.read_to_end(&mut out).context("reading decrypted stream")?;
    Ok(SecretVec::new(out))
}
