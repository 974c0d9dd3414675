//! Flattened JWS parsing and RS256 verification.
//!
//! RSASSA-PKCS1-v1_5 with SHA-256 is the only algorithm this core accepts;
//! the public key always comes from a JWK, either inline (`jwk`, new-account)
//! or resolved from a stored account (`kid`).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use rsa::{BigUint, Pkcs1v15Sign, RsaPublicKey};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{AcmeErrorType, ApiError};

/// The flattened JWS JSON body of every authenticated ACME POST.
#[derive(Debug, Deserialize)]
pub struct FlattenedJws {
    pub protected: String,
    #[serde(default)]
    pub payload: String,
    pub signature: String,
}

/// Decoded protected header.
#[derive(Debug, Deserialize)]
pub struct ProtectedHeader {
    pub alg: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub jwk: Option<Value>,
    #[serde(default)]
    pub kid: Option<String>,
}

/// A JWS whose signature has been checked against a resolved key.
#[derive(Debug)]
pub struct VerifiedJws {
    pub header: ProtectedHeader,
    pub payload: Vec<u8>,
    /// Account id when the request carried a `kid`.
    pub account_id: Option<String>,
    /// The JWK the signature verified against.
    pub jwk: Value,
}

pub fn decode_base64url(s: &str) -> Result<Vec<u8>, ApiError> {
    URL_SAFE_NO_PAD
        .decode(s.trim())
        .map_err(|e| ApiError::acme(AcmeErrorType::Malformed, format!("invalid base64url: {e}")))
}

pub fn parse_flattened_jws(body: &[u8]) -> Result<FlattenedJws, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError::acme(AcmeErrorType::Malformed, format!("invalid JWS body: {e}")))
}

pub fn decode_protected_header(protected_b64: &str) -> Result<ProtectedHeader, ApiError> {
    let raw = decode_base64url(protected_b64)?;
    serde_json::from_slice(&raw).map_err(|e| {
        ApiError::acme(
            AcmeErrorType::Malformed,
            format!("invalid protected header: {e}"),
        )
    })
}

/// The account id is the trailing path segment of the `kid` URL.
pub fn account_id_from_kid(kid: &str) -> Option<String> {
    kid.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// Verify `protected + "." + payload` with the JWK's RSA public key.
pub fn verify_rs256(jwk: &Value, signing_input: &[u8], signature: &[u8]) -> Result<(), ApiError> {
    let kty = jwk.get("kty").and_then(Value::as_str).unwrap_or_default();
    if kty != "RSA" {
        return Err(ApiError::acme(
            AcmeErrorType::Malformed,
            format!("unsupported JWK key type {kty:?}; only RSA is accepted"),
        ));
    }
    let n = jwk
        .get("n")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::acme(AcmeErrorType::Malformed, "JWK is missing n"))?;
    let e = jwk
        .get("e")
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::acme(AcmeErrorType::Malformed, "JWK is missing e"))?;

    let n = BigUint::from_bytes_be(&decode_base64url(n)?);
    let e = BigUint::from_bytes_be(&decode_base64url(e)?);
    let key = RsaPublicKey::new(n, e)
        .map_err(|e| ApiError::acme(AcmeErrorType::Malformed, format!("invalid RSA JWK: {e}")))?;

    let hashed = Sha256::digest(signing_input);
    key.verify(Pkcs1v15Sign::new::<Sha256>(), &hashed, signature)
        .map_err(|_| ApiError::Unauthorized("JWS signature verification failed".into()))
}

/// SHA-256 over the canonical JWK form `{"e","kty","n"}` in lexical order,
/// base64url without padding.
pub fn jwk_thumbprint(jwk: &Value) -> Result<String, ApiError> {
    let get = |field: &str| {
        jwk.get(field).and_then(Value::as_str).ok_or_else(|| {
            ApiError::acme(
                AcmeErrorType::Malformed,
                format!("JWK is missing {field} for thumbprint"),
            )
        })
    };
    let canonical = format!(
        r#"{{"e":"{}","kty":"{}","n":"{}"}}"#,
        get("e")?,
        get("kty")?,
        get("n")?
    );
    Ok(URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes())))
}

/// 16 random bytes, base64url without padding. Used for challenge tokens and
/// replay nonces alike.
pub fn random_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Client-side JWS construction used by the protocol tests.
#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use rsa::traits::PublicKeyParts;
    use rsa::RsaPrivateKey;

    pub fn test_rsa_key() -> RsaPrivateKey {
        RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap()
    }

    pub fn jwk_for(key: &RsaPrivateKey) -> Value {
        let public = key.to_public_key();
        serde_json::json!({
            "kty": "RSA",
            "n": URL_SAFE_NO_PAD.encode(public.n().to_bytes_be()),
            "e": URL_SAFE_NO_PAD.encode(public.e().to_bytes_be()),
        })
    }

    pub fn sign_rs256(key: &RsaPrivateKey, input: &[u8]) -> Vec<u8> {
        let hashed = Sha256::digest(input);
        key.sign(Pkcs1v15Sign::new::<Sha256>(), &hashed).unwrap()
    }

    /// Assemble a flattened JWS body around a protected header and payload.
    pub fn flattened_jws(key: &RsaPrivateKey, protected: &Value, payload: &Value) -> Vec<u8> {
        let protected_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(protected).unwrap());
        let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload).unwrap());
        let signing_input = format!("{protected_b64}.{payload_b64}");
        let signature = URL_SAFE_NO_PAD.encode(sign_rs256(key, signing_input.as_bytes()));
        serde_json::to_vec(&serde_json::json!({
            "protected": protected_b64,
            "payload": payload_b64,
            "signature": signature,
        }))
        .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn verifies_valid_signature_and_rejects_tampering() {
        let key = test_rsa_key();
        let jwk = jwk_for(&key);
        let input = b"eyJhbGciOiJSUzI1NiJ9.eyJmb28iOiJiYXIifQ";
        let sig = sign_rs256(&key, input);

        verify_rs256(&jwk, input, &sig).expect("valid signature verifies");

        let mut bad_sig = sig.clone();
        bad_sig[0] ^= 0xff;
        assert!(matches!(
            verify_rs256(&jwk, input, &bad_sig).unwrap_err(),
            ApiError::Unauthorized(_)
        ));
        assert!(verify_rs256(&jwk, b"different input", &sig).is_err());
    }

    #[test]
    fn rejects_non_rsa_jwk() {
        let jwk = serde_json::json!({"kty": "EC", "crv": "P-256"});
        let err = verify_rs256(&jwk, b"x", b"y").unwrap_err();
        assert!(matches!(
            err,
            ApiError::Acme {
                acme_type: AcmeErrorType::Malformed,
                ..
            }
        ));
    }

    #[test]
    fn thumbprint_matches_rfc7638_vector() {
        // The example key from RFC 7638 §3.1.
        let jwk = serde_json::json!({
            "kty": "RSA",
            "n": "0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAtVT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn64tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FDW2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n91CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINHaQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw",
            "e": "AQAB",
        });
        assert_eq!(
            jwk_thumbprint(&jwk).unwrap(),
            "NzbLsXh8uDCcd-6MNwXF4W_7noWXFZAfHkxZsRGC9Xs"
        );
    }

    #[test]
    fn kid_account_extraction() {
        assert_eq!(
            account_id_from_kid("http://localhost:8420/acme/account/acct-1a2b").as_deref(),
            Some("acct-1a2b")
        );
        assert_eq!(
            account_id_from_kid("http://localhost/acme/account/x/").as_deref(),
            Some("x")
        );
        assert_eq!(account_id_from_kid(""), None);
    }

    #[test]
    fn tokens_are_unique_and_urlsafe() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let token = random_token();
            assert_eq!(URL_SAFE_NO_PAD.decode(&token).unwrap().len(), 16);
            assert!(seen.insert(token), "token collision");
        }
    }
}
