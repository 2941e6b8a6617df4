//! Build signature computation.
//!
//! The signature decides whether a finished artifact can be reused for a new
//! request, and it crosses process boundaries (request path and worker path
//! both compute it), so the field order below is normative and must never
//! depend on map iteration order. Callers serialize list payloads in a
//! canonical form (sorted id sets, deduplicated path lists, `BTreeMap` for
//! floating-feature overrides) before digesting.

use sha2::{Digest, Sha256};

/// First 16 hex chars (64 bits) of SHA-256 over a serialized payload.
pub fn payload_digest(serialized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    let digest = hasher.finalize();
    hex_prefix(&digest, 16)
}

/// The normative signature inputs, in order.
#[derive(Debug, Clone, Default)]
pub struct BuildSignatureInputs {
    pub target: String,
    pub source_commit: String,
    pub source_firmware: String,
    pub target_firmware: String,
    pub version_major: i64,
    pub version_minor: i64,
    pub version_patch: i64,
    pub version_suffix: String,
    pub extra_mods_digest: String,
    pub mods_disabled_digest: String,
    pub debloat_disabled_digest: String,
    pub debloat_add_system_digest: String,
    pub debloat_add_product_digest: String,
    pub ff_overrides_digest: String,
}

/// First 40 hex chars (160 bits) of SHA-256 over the `|`-joined inputs.
pub fn build_signature(inputs: &BuildSignatureInputs) -> String {
    let payload = [
        inputs.target.as_str(),
        inputs.source_commit.as_str(),
        inputs.source_firmware.as_str(),
        inputs.target_firmware.as_str(),
        &inputs.version_major.to_string(),
        &inputs.version_minor.to_string(),
        &inputs.version_patch.to_string(),
        inputs.version_suffix.as_str(),
        inputs.extra_mods_digest.as_str(),
        inputs.mods_disabled_digest.as_str(),
        inputs.debloat_disabled_digest.as_str(),
        inputs.debloat_add_system_digest.as_str(),
        inputs.debloat_add_product_digest.as_str(),
        inputs.ff_overrides_digest.as_str(),
    ]
    .join("|");

    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    hex_prefix(&hasher.finalize(), 40)
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for byte in bytes {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
        if out.len() >= chars {
            break;
        }
    }
    out.truncate(chars);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BuildSignatureInputs {
        BuildSignatureInputs {
            target: "b0s".into(),
            source_commit: "abc1234".into(),
            source_firmware: "SM-S901B/EUX/S901BXXU9FYA1".into(),
            target_firmware: "SM-S911B/EUX/S911BXXU5DYA4".into(),
            version_major: 4,
            version_minor: 1,
            version_patch: 0,
            version_suffix: String::new(),
            extra_mods_digest: payload_digest("[]"),
            mods_disabled_digest: payload_digest("[]"),
            debloat_disabled_digest: payload_digest("[]"),
            debloat_add_system_digest: payload_digest("[]"),
            debloat_add_product_digest: payload_digest("[]"),
            ff_overrides_digest: payload_digest("{}"),
        }
    }

    #[test]
    fn signature_is_deterministic() {
        assert_eq!(build_signature(&sample()), build_signature(&sample()));
    }

    #[test]
    fn signature_is_160_bits_hex() {
        let sig = build_signature(&sample());
        assert_eq!(sig.len(), 40);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn every_field_participates() {
        let base = build_signature(&sample());

        let mut other = sample();
        other.version_suffix = "beta".into();
        assert_ne!(base, build_signature(&other));

        let mut other = sample();
        other.ff_overrides_digest = payload_digest(r#"{"SEC_FLOATING_FEATURE_X":"TRUE"}"#);
        assert_ne!(base, build_signature(&other));

        let mut other = sample();
        other.source_commit = "def5678".into();
        assert_ne!(base, build_signature(&other));
    }

    #[test]
    fn payload_digest_is_64_bits_hex() {
        let digest = payload_digest(r#"["system:app/Foo"]"#);
        assert_eq!(digest.len(), 16);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
