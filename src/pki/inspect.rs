//! Certificate inspection for the dashboard and the info endpoints.

use anyhow::Context;
use serde::Serialize;
use sha2::{Digest, Sha256};
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;

/// Parsed facts about a certificate, shaped for the JSON surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateDetails {
    pub subject: String,
    pub issuer: String,
    pub serial_number: String,
    pub not_before: String,
    pub not_after: String,
    pub fingerprint_sha256: String,
    pub san_list: Vec<String>,
    pub key_type: String,
    pub key_info: String,
    pub signature_algorithm: String,
}

/// Parse the first certificate in a PEM string.
pub fn parse_certificate(pem: &str) -> anyhow::Result<CertificateDetails> {
    let (_, parsed_pem) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
        .map_err(|e| anyhow::anyhow!("no PEM block found: {e:?}"))?;
    let cert = parsed_pem
        .parse_x509()
        .context("PEM block is not an X.509 certificate")?;

    let san_list = cert
        .subject_alternative_name()
        .ok()
        .flatten()
        .map(|ext| {
            ext.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    let (key_type, key_info) = match cert.public_key().parsed() {
        Ok(PublicKey::RSA(rsa)) => ("RSA".to_string(), format!("{} bit", rsa.key_size())),
        Ok(PublicKey::EC(ec)) => {
            // Uncompressed point: one tag byte plus two field elements.
            let field_bits = ec.data().len().saturating_sub(1) / 2 * 8;
            ("ECDSA".to_string(), format!("P-{field_bits}"))
        }
        Ok(_) => ("other".to_string(), String::new()),
        Err(_) => ("unknown".to_string(), String::new()),
    };

    Ok(CertificateDetails {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        serial_number: cert.raw_serial_as_string(),
        not_before: asn1_time_to_rfc3339(&cert.validity().not_before)?,
        not_after: asn1_time_to_rfc3339(&cert.validity().not_after)?,
        fingerprint_sha256: sha256_fingerprint(&parsed_pem.contents),
        san_list,
        key_type,
        key_info,
        signature_algorithm: signature_algorithm_name(
            &cert.signature_algorithm.algorithm.to_id_string(),
        ),
    })
}

fn asn1_time_to_rfc3339(t: &ASN1Time) -> anyhow::Result<String> {
    let ts = t.to_datetime().unix_timestamp();
    let dt = chrono::DateTime::from_timestamp(ts, 0).context("certificate date out of range")?;
    Ok(dt.to_rfc3339())
}

/// Uppercase colon-separated SHA-256 digest over the certificate DER.
pub fn sha256_fingerprint(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    digest
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn signature_algorithm_name(oid: &str) -> String {
    match oid {
        "1.2.840.113549.1.1.11" => "sha256WithRSAEncryption".to_string(),
        "1.2.840.113549.1.1.12" => "sha384WithRSAEncryption".to_string(),
        "1.2.840.113549.1.1.13" => "sha512WithRSAEncryption".to_string(),
        "1.2.840.10045.4.3.2" => "ecdsa-with-SHA256".to_string(),
        "1.2.840.10045.4.3.3" => "ecdsa-with-SHA384".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::{
        build_root_certificate, generate_keypair, CaBuildOptions, HashAlgorithm, KeyAlgorithm,
    };

    #[test]
    fn parses_generated_certificate() {
        let key = generate_keypair(KeyAlgorithm::EcP256, HashAlgorithm::default()).unwrap();
        let (cert, not_after) = build_root_certificate(
            &key,
            &CaBuildOptions {
                common_name: "Inspect Root".into(),
                validity_years: 1,
            },
        )
        .unwrap();

        let details = parse_certificate(&cert.pem()).unwrap();
        assert!(details.subject.contains("Inspect Root"));
        assert_eq!(details.subject, details.issuer);
        assert_eq!(details.key_type, "ECDSA");
        assert_eq!(details.key_info, "P-256");
        assert_eq!(details.signature_algorithm, "ecdsa-with-SHA256");
        assert!(!details.fingerprint_sha256.is_empty());
        assert!(details.fingerprint_sha256.contains(':'));
        // Same calendar expiry as the builder reported, modulo formatting.
        assert_eq!(&details.not_after[..10], &not_after[..10]);
    }

    #[test]
    fn rejects_non_certificate_input() {
        assert!(parse_certificate("not a pem").is_err());
    }
}
