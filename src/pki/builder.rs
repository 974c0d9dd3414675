//! X.509 certificate construction for CAs and leaves.

use anyhow::Context;
use chrono::{DateTime, Months, Utc};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CustomExtension, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};

/// certificatePolicies extension OID.
const OID_CERTIFICATE_POLICIES: &[u64] = &[2, 5, 29, 32];

/// Options for building a root or intermediate CA certificate.
#[derive(Debug, Clone)]
pub struct CaBuildOptions {
    pub common_name: String,
    pub validity_years: u32,
}

/// Options for building a leaf certificate.
#[derive(Debug, Clone)]
pub struct LeafBuildOptions {
    pub subject_cn: String,
    /// Unique, lowercased DNS names; the builder trusts the caller's dedup.
    pub san_dns: Vec<String>,
    pub validity_days: u32,
    /// When set, a certificatePolicies extension with this single policy
    /// identifier is added.
    pub ev_policy_oid: Option<String>,
}

/// Serial numbers are short decimals derived from the current epoch
/// (last 8 digits), matching what operators see in the dashboard.
pub fn epoch_serial() -> u64 {
    (Utc::now().timestamp().max(0) as u64) % 100_000_000
}

fn to_offset_time(dt: DateTime<Utc>) -> anyhow::Result<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(dt.timestamp()).context("timestamp out of range")
}

fn ca_params(opts: &CaBuildOptions) -> anyhow::Result<(CertificateParams, DateTime<Utc>)> {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, opts.common_name.clone());

    let mut params = CertificateParams::default();
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.serial_number = Some(SerialNumber::from(epoch_serial()));

    let not_before = Utc::now();
    let not_after = not_before
        .checked_add_months(Months::new(opts.validity_years.saturating_mul(12)))
        .context("CA validity overflows the calendar")?;
    params.not_before = to_offset_time(not_before)?;
    params.not_after = to_offset_time(not_after)?;

    Ok((params, not_after))
}

/// Build a self-signed root CA certificate. Returns the certificate and its
/// expiry as a UTC ISO-8601 string.
pub fn build_root_certificate(
    key: &KeyPair,
    opts: &CaBuildOptions,
) -> anyhow::Result<(Certificate, String)> {
    let (params, not_after) = ca_params(opts)?;
    let cert = params
        .self_signed(key)
        .context("self-signing root certificate")?;
    Ok((cert, not_after.to_rfc3339()))
}

/// Build an intermediate CA certificate signed by its parent root.
pub fn build_intermediate_certificate(
    key: &KeyPair,
    parent_cert: &Certificate,
    parent_key: &KeyPair,
    opts: &CaBuildOptions,
) -> anyhow::Result<(Certificate, String)> {
    let (params, not_after) = ca_params(opts)?;
    let cert = params
        .signed_by(key, parent_cert, parent_key)
        .context("signing intermediate certificate")?;
    Ok((cert, not_after.to_rfc3339()))
}

/// Populate leaf certificate params shared by key-owned and CSR-keyed
/// issuance paths.
pub fn apply_leaf_params(
    params: &mut CertificateParams,
    opts: &LeafBuildOptions,
) -> anyhow::Result<DateTime<Utc>> {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, opts.subject_cn.clone());
    params.distinguished_name = dn;

    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    params.serial_number = Some(SerialNumber::from(epoch_serial()));

    params.subject_alt_names = opts
        .san_dns
        .iter()
        .map(|name| {
            Ia5String::try_from(name.as_str())
                .map(SanType::DnsName)
                .map_err(|_| anyhow::anyhow!("invalid DNS name for SAN: {name}"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    if let Some(oid) = &opts.ev_policy_oid {
        params
            .custom_extensions
            .push(certificate_policies_extension(oid)?);
    }

    let not_before = Utc::now();
    let not_after = not_before + chrono::Duration::days(i64::from(opts.validity_days));
    params.not_before = to_offset_time(not_before)?;
    params.not_after = to_offset_time(not_after)?;

    Ok(not_after)
}

/// Build a leaf certificate for a locally generated keypair.
pub fn build_leaf_certificate(
    key: &KeyPair,
    issuer_cert: &Certificate,
    issuer_key: &KeyPair,
    opts: &LeafBuildOptions,
) -> anyhow::Result<(Certificate, String)> {
    let mut params = CertificateParams::default();
    let not_after = apply_leaf_params(&mut params, opts)?;
    let cert = params
        .signed_by(key, issuer_cert, issuer_key)
        .context("signing leaf certificate")?;
    Ok((cert, not_after.to_rfc3339()))
}

/// certificatePolicies with exactly one policy identifier:
/// SEQUENCE { SEQUENCE { OBJECT IDENTIFIER } }.
fn certificate_policies_extension(oid: &str) -> anyhow::Result<CustomExtension> {
    let arcs = parse_oid(oid)?;
    let oid_tlv = der_tlv(0x06, encode_oid_arcs(&arcs)?);
    let policy_info = der_tlv(0x30, oid_tlv);
    let value = der_tlv(0x30, policy_info);
    Ok(CustomExtension::from_oid_content(
        OID_CERTIFICATE_POLICIES,
        value,
    ))
}

fn parse_oid(oid: &str) -> anyhow::Result<Vec<u64>> {
    let arcs = oid
        .split('.')
        .map(|part| part.parse::<u64>())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("invalid policy OID {oid:?}"))?;
    if arcs.len() < 2 || arcs[0] > 2 || (arcs[0] < 2 && arcs[1] > 39) {
        anyhow::bail!("invalid policy OID {oid:?}");
    }
    Ok(arcs)
}

fn encode_oid_arcs(arcs: &[u64]) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::new();
    out.extend(encode_base128(arcs[0] * 40 + arcs[1]));
    for arc in &arcs[2..] {
        out.extend(encode_base128(*arc));
    }
    Ok(out)
}

fn encode_base128(mut value: u64) -> Vec<u8> {
    let mut bytes = vec![(value & 0x7f) as u8];
    value >>= 7;
    while value > 0 {
        bytes.push(((value & 0x7f) as u8) | 0x80);
        value >>= 7;
    }
    bytes.reverse();
    bytes
}

fn der_tlv(tag: u8, content: Vec<u8>) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();
    if len < 128 {
        out.push(len as u8);
    } else if len <= 0xff {
        out.push(0x81);
        out.push(len as u8);
    } else {
        out.push(0x82);
        out.push((len >> 8) as u8);
        out.push((len & 0xff) as u8);
    }
    out.extend(content);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::{generate_keypair, HashAlgorithm, KeyAlgorithm};
    use chrono::Datelike;

    fn ec_key() -> KeyPair {
        generate_keypair(KeyAlgorithm::EcP256, HashAlgorithm::default()).unwrap()
    }

    #[test]
    fn epoch_serial_is_short_decimal() {
        let serial = epoch_serial();
        assert!(serial < 100_000_000);
    }

    #[test]
    fn oid_der_encoding_matches_known_vector() {
        // 2.5.29.32 encodes to 55 1D 20.
        let arcs = parse_oid("2.5.29.32").unwrap();
        assert_eq!(encode_oid_arcs(&arcs).unwrap(), vec![0x55, 0x1d, 0x20]);
        // 1.2.840.113549 from the PKCS arc.
        let arcs = parse_oid("1.2.840.113549").unwrap();
        assert_eq!(
            encode_oid_arcs(&arcs).unwrap(),
            vec![0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d]
        );
        assert!(parse_oid("not.an.oid").is_err());
        assert!(parse_oid("1").is_err());
    }

    #[test]
    fn root_certificate_is_self_signed_ca() {
        let key = ec_key();
        let (cert, not_after) = build_root_certificate(
            &key,
            &CaBuildOptions {
                common_name: "Unit Root".into(),
                validity_years: 2,
            },
        )
        .unwrap();
        let pem = cert.pem();
        assert!(pem.contains("BEGIN CERTIFICATE"));
        assert!(not_after.starts_with(&format!("{}", chrono::Utc::now().year() + 2)));

        let details = crate::pki::parse_certificate(&pem).unwrap();
        assert_eq!(details.subject, details.issuer);
        assert!(details.subject.contains("Unit Root"));
    }

    #[test]
    fn leaf_certificate_carries_sans_and_chains_to_issuer() {
        let ca_key = ec_key();
        let (ca_cert, _) = build_root_certificate(
            &ca_key,
            &CaBuildOptions {
                common_name: "Unit Root".into(),
                validity_years: 1,
            },
        )
        .unwrap();

        let leaf_key = ec_key();
        let (leaf, _) = build_leaf_certificate(
            &leaf_key,
            &ca_cert,
            &ca_key,
            &LeafBuildOptions {
                subject_cn: "app.example.com".into(),
                san_dns: vec!["app.example.com".into(), "www.example.com".into()],
                validity_days: 30,
                ev_policy_oid: None,
            },
        )
        .unwrap();

        let details = crate::pki::parse_certificate(&leaf.pem()).unwrap();
        assert!(details.issuer.contains("Unit Root"));
        assert_eq!(
            details.san_list,
            vec!["app.example.com".to_string(), "www.example.com".to_string()]
        );
    }
}
