//! ES256 key material in JWK form.

use crate::error::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jose_jwk::jose_jwa::{Algorithm, Signing};
use jose_jwk::{Class, Jwk, Key, Parameters, crypto};
use p256::ecdsa::SigningKey;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

/// Generate a fresh P-256 private key with `kid`, `alg=ES256` and `use=sig`.
///
/// The key id is the RFC 7638 thumbprint of the public half.
pub fn generate_secret_jwk() -> Jwk {
    let secret = p256::SecretKey::random(&mut OsRng);
    let public = Key::from(&crypto::Key::from(secret.public_key()));
    let kid = key_thumbprint(&public).ok();

    Jwk {
        key: Key::from(&crypto::Key::from(secret)),
        prm: Parameters {
            kid,
            alg: Some(Algorithm::Signing(Signing::Es256)),
            cls: Some(Class::Signing),
            ..Default::default()
        },
    }
}

/// Copy of `private` without the `d` component. Parameters are kept.
pub fn to_public_jwk(private: &Jwk) -> Result<Jwk> {
    let key = match &private.key {
        Key::Ec(ec) if matches!(ec.crv, jose_jwk::EcCurves::P256) => Key::Ec(jose_jwk::Ec {
            crv: ec.crv.clone(),
            x: ec.x.clone(),
            y: ec.y.clone(),
            d: None,
        }),
        _ => return Err(Error::InvalidKey("expected a P-256 EC key".to_string())),
    };

    Ok(Jwk {
        key,
        prm: private.prm.clone(),
    })
}

/// Signing key behind a private JWK.
pub fn signing_key(jwk: &Jwk) -> Result<SigningKey> {
    match crypto::Key::try_from(&jwk.key)
        .map_err(|e| Error::InvalidKey(format!("unusable key: {:?}", e)))?
    {
        crypto::Key::P256(crypto::Kind::Secret(secret)) => Ok(SigningKey::from(secret)),
        _ => Err(Error::InvalidKey("key must be a P-256 secret key".to_string())),
    }
}

/// RFC 7638 SHA-256 thumbprint of an EC JWK, base64url without padding.
pub fn thumbprint(jwk: &Jwk) -> Result<String> {
    key_thumbprint(&jwk.key)
}

fn key_thumbprint(key: &Key) -> Result<String> {
    let Key::Ec(ec) = key else {
        return Err(Error::InvalidKey("thumbprint requires an EC key".to_string()));
    };
    let value = serde_json::to_value(ec).map_err(|e| Error::InvalidKey(e.to_string()))?;
    let field = |name: &str| {
        value
            .get(name)
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .ok_or_else(|| Error::InvalidKey(format!("missing {name}")))
    };

    // Members in lexicographic order, no whitespace.
    let canonical = format!(
        r#"{{"crv":"{}","kty":"EC","x":"{}","y":"{}"}}"#,
        field("crv")?,
        field("x")?,
        field("y")?
    );
    Ok(URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes())))
}

pub fn parse_jwk(raw: &str) -> Result<Jwk> {
    serde_json::from_str(raw).map_err(|e| Error::InvalidKey(format!("malformed JWK: {}", e)))
}

pub fn jwk_to_string(jwk: &Jwk) -> Result<String> {
    serde_json::to_string(jwk).map_err(|e| Error::InvalidKey(e.to_string()))
}

/// Make sure a loaded service key carries the parameters ES256 signing needs.
pub fn normalize_signing_jwk(mut jwk: Jwk) -> Result<Jwk> {
    signing_key(&jwk)?;
    if jwk.prm.kid.is_none() {
        jwk.prm.kid = Some(thumbprint(&jwk)?);
    }
    jwk.prm.alg.get_or_insert(Algorithm::Signing(Signing::Es256));
    jwk.prm.cls.get_or_insert(Class::Signing);
    Ok(jwk)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_has_es256_parameters() {
        let jwk = generate_secret_jwk();
        let json = serde_json::to_value(&jwk).unwrap();
        assert_eq!(json["kty"], "EC");
        assert_eq!(json["crv"], "P-256");
        assert_eq!(json["alg"], "ES256");
        assert_eq!(json["use"], "sig");
        assert!(json["d"].is_string());
        assert_eq!(json["kid"].as_str(), Some(thumbprint(&jwk).unwrap().as_str()));
    }

    #[test]
    fn public_jwk_drops_private_component() {
        let jwk = generate_secret_jwk();
        let public = to_public_jwk(&jwk).unwrap();
        let json = serde_json::to_value(&public).unwrap();
        assert!(json.get("d").is_none());
        assert_eq!(json["kid"], serde_json::to_value(&jwk).unwrap()["kid"]);

        // Round trip through the JSON form keeps the public key.
        let reparsed = parse_jwk(&serde_json::to_string(&public).unwrap()).unwrap();
        let expected = signing_key(&jwk).unwrap();
        match crypto::Key::try_from(&reparsed.key).unwrap() {
            crypto::Key::P256(crypto::Kind::Public(public)) => {
                assert_eq!(
                    p256::ecdsa::VerifyingKey::from(public),
                    *expected.verifying_key()
                );
            }
            _ => panic!("expected a P-256 public key"),
        }
    }

    #[test]
    fn public_key_cannot_sign() {
        let public = to_public_jwk(&generate_secret_jwk()).unwrap();
        assert!(signing_key(&public).is_err());
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(parse_jwk("{\"kty\":\"EC\"}").is_err());
        assert!(parse_jwk("not json").is_err());
    }

    #[test]
    fn thumbprint_matches_rfc7638_shape() {
        let jwk = generate_secret_jwk();
        let print = thumbprint(&jwk).unwrap();
        // SHA-256 is 32 bytes, 43 characters unpadded.
        assert_eq!(print.len(), 43);
        assert_eq!(print, thumbprint(&to_public_jwk(&jwk).unwrap()).unwrap());
    }

    #[test]
    fn normalize_fills_missing_kid() {
        let mut jwk = generate_secret_jwk();
        jwk.prm.kid = None;
        jwk.prm.alg = None;
        let jwk = normalize_signing_jwk(jwk).unwrap();
        assert!(jwk.prm.kid.is_some());
        assert_eq!(serde_json::to_value(&jwk).unwrap()["alg"], "ES256");
    }
}
