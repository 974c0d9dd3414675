//! Keypair generation and signing-key loading.
//!
//! RSA keys come from the `rsa` crate (standard primes, public exponent
//! 65537) and are handed to rcgen as PKCS#8 PEM; ECDSA keys are generated by
//! rcgen directly with the curve-matched digest.

use anyhow::Context;
use rcgen::KeyPair;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;

/// Supported keypair algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Rsa2048,
    Rsa3072,
    Rsa4096,
    EcP256,
    EcP384,
}

impl KeyAlgorithm {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rsa-2048" | "rsa2048" => Some(KeyAlgorithm::Rsa2048),
            "rsa-3072" | "rsa3072" => Some(KeyAlgorithm::Rsa3072),
            "rsa-4096" | "rsa4096" => Some(KeyAlgorithm::Rsa4096),
            "ec-p256" | "p256" => Some(KeyAlgorithm::EcP256),
            "ec-p384" | "p384" => Some(KeyAlgorithm::EcP384),
            _ => None,
        }
    }

    /// Map a bare RSA key width (2048/3072/4096) to an algorithm.
    pub fn from_rsa_bits(bits: u32) -> Option<Self> {
        match bits {
            2048 => Some(KeyAlgorithm::Rsa2048),
            3072 => Some(KeyAlgorithm::Rsa3072),
            4096 => Some(KeyAlgorithm::Rsa4096),
            _ => None,
        }
    }

    pub fn is_rsa(&self) -> bool {
        matches!(
            self,
            KeyAlgorithm::Rsa2048 | KeyAlgorithm::Rsa3072 | KeyAlgorithm::Rsa4096
        )
    }

    pub fn rsa_bits(&self) -> Option<usize> {
        match self {
            KeyAlgorithm::Rsa2048 => Some(2048),
            KeyAlgorithm::Rsa3072 => Some(3072),
            KeyAlgorithm::Rsa4096 => Some(4096),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyAlgorithm::Rsa2048 => "rsa-2048",
            KeyAlgorithm::Rsa3072 => "rsa-3072",
            KeyAlgorithm::Rsa4096 => "rsa-4096",
            KeyAlgorithm::EcP256 => "ec-p256",
            KeyAlgorithm::EcP384 => "ec-p384",
        }
    }
}

/// Recognized signing digests. ECDSA keys ignore this and keep the digest
/// matched to their curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Some(HashAlgorithm::Sha256),
            "sha384" | "sha-384" => Some(HashAlgorithm::Sha384),
            "sha512" | "sha-512" => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    fn rsa_signature_algorithm(&self) -> &'static rcgen::SignatureAlgorithm {
        match self {
            HashAlgorithm::Sha256 => &rcgen::PKCS_RSA_SHA256,
            HashAlgorithm::Sha384 => &rcgen::PKCS_RSA_SHA384,
            HashAlgorithm::Sha512 => &rcgen::PKCS_RSA_SHA512,
        }
    }
}

/// Generate a fresh keypair. RSA generation is compute-heavy and synchronous;
/// callers on the async path wrap this in `spawn_blocking`.
pub fn generate_keypair(algorithm: KeyAlgorithm, hash: HashAlgorithm) -> anyhow::Result<KeyPair> {
    match algorithm {
        KeyAlgorithm::EcP256 => KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .context("generating P-256 keypair"),
        KeyAlgorithm::EcP384 => KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384)
            .context("generating P-384 keypair"),
        rsa_alg => {
            let bits = rsa_alg.rsa_bits().expect("rsa algorithm has a key width");
            let mut rng = rand::thread_rng();
            let private_key = RsaPrivateKey::new(&mut rng, bits)
                .with_context(|| format!("generating RSA-{bits} keypair"))?;
            let pem = private_key
                .to_pkcs8_pem(LineEnding::LF)
                .context("encoding RSA key as PKCS#8")?;
            KeyPair::from_pem_and_sign_algo(pem.as_str(), hash.rsa_signature_algorithm())
                .context("loading generated RSA key into signer")
        }
    }
}

/// Load a CA signing key from its PEM. CA keys are RSA in this core; the
/// configured hash algorithm selects the signature digest. Falls back to
/// plain detection so certificate reads keep working on foreign material.
pub fn load_signing_key(pem: &str, hash: HashAlgorithm) -> anyhow::Result<KeyPair> {
    KeyPair::from_pem_and_sign_algo(pem, hash.rsa_signature_algorithm())
        .or_else(|_| KeyPair::from_pem(pem))
        .context("parsing CA private key PEM")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_algorithm_names_and_key_sizes() {
        assert_eq!(KeyAlgorithm::parse("rsa-2048"), Some(KeyAlgorithm::Rsa2048));
        assert_eq!(KeyAlgorithm::parse("EC-P384"), Some(KeyAlgorithm::EcP384));
        assert_eq!(KeyAlgorithm::parse("dsa"), None);
        assert_eq!(
            KeyAlgorithm::from_rsa_bits(3072),
            Some(KeyAlgorithm::Rsa3072)
        );
        assert_eq!(KeyAlgorithm::from_rsa_bits(1024), None);
    }

    #[test]
    fn parses_hash_names_with_default() {
        assert_eq!(HashAlgorithm::parse("sha256"), Some(HashAlgorithm::Sha256));
        assert_eq!(HashAlgorithm::parse("SHA-512"), Some(HashAlgorithm::Sha512));
        assert_eq!(HashAlgorithm::parse("md5"), None);
        assert_eq!(HashAlgorithm::default(), HashAlgorithm::Sha256);
    }

    #[test]
    fn generates_ecdsa_keypairs() {
        let key = generate_keypair(KeyAlgorithm::EcP256, HashAlgorithm::default()).unwrap();
        assert!(key.serialize_pem().contains("PRIVATE KEY"));
        let key = generate_keypair(KeyAlgorithm::EcP384, HashAlgorithm::default()).unwrap();
        assert!(key.serialize_pem().contains("PRIVATE KEY"));
    }

    #[test]
    fn generates_and_reloads_rsa_keypair() {
        // 2048 keeps the test fast; the larger widths share the same path.
        let key = generate_keypair(KeyAlgorithm::Rsa2048, HashAlgorithm::Sha256).unwrap();
        let pem = key.serialize_pem();
        let reloaded = load_signing_key(&pem, HashAlgorithm::Sha256).unwrap();
        assert_eq!(reloaded.serialize_der(), key.serialize_der());
    }
}
