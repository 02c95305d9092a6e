//! COSE_Sign1 single-signer envelopes (RFC 9052) for statements, tree heads and receipts.
//!
//! Wire form: CBOR tag 18 around `[protected, unprotected, payload, signature]`.
//! The protected header carries the algorithm (EdDSA), the signer's key id and
//! a content type naming the payload kind. The signature covers the
//! `Sig_structure` `["Signature1", protected, h'', payload]`.

use std::collections::BTreeMap;

use ed25519_dalek::{Signature, Signer as _, SigningKey, VerifyingKey};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_bytes::{ByteBuf, Bytes};
use serde_cbor::Value;

use crate::crypto::key_id;
use crate::{Result, TlogError};

/// COSE algorithm identifier for EdDSA.
pub const COSE_ALG_EDDSA: i64 = -8;

const LABEL_ALG: i64 = 1;
const LABEL_CONTENT_TYPE: i64 = 3;
const LABEL_KID: i64 = 4;

/// Tag 18 (COSE_Sign1) as a one-byte CBOR head.
const COSE_SIGN1_TAG: u8 = 0xd2;

/// Payload kinds, distinguished by the protected content type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadKind {
    Statement,
    TreeHead,
    Receipt,
}

impl PayloadKind {
    pub fn content_type(self) -> &'static str {
        match self {
            PayloadKind::Statement => "application/vnd.tlog.statement+cbor",
            PayloadKind::TreeHead => "application/vnd.tlog.tree-head+cbor",
            PayloadKind::Receipt => "application/vnd.tlog.receipt+cbor",
        }
    }

    pub fn from_content_type(content_type: &str) -> Option<Self> {
        [PayloadKind::Statement, PayloadKind::TreeHead, PayloadKind::Receipt]
            .into_iter()
            .find(|k| k.content_type() == content_type)
    }
}

/// A payload schema carried in an envelope.
pub trait Claims: Serialize + DeserializeOwned {
    const KIND: PayloadKind;

    /// Structural checks beyond what decoding enforces.
    fn validate(&self) -> Result<()>;
}

/// A decoded, not yet verified, COSE_Sign1 envelope.
#[derive(Clone, Debug)]
pub struct CoseSign1 {
    protected: Vec<u8>,
    alg: i64,
    kid: Vec<u8>,
    content_type: String,
    payload: Vec<u8>,
    signature: Vec<u8>,
}

type WireSign1 = (ByteBuf, Value, ByteBuf, ByteBuf);

fn malformed(what: impl Into<String>) -> TlogError {
    TlogError::Signature(format!("malformed envelope: {}", what.into()))
}

fn sig_structure(protected: &[u8], payload: &[u8]) -> Result<Vec<u8>> {
    serde_cbor::to_vec(&(
        "Signature1",
        Bytes::new(protected),
        Bytes::new(&[]),
        Bytes::new(payload),
    ))
    .map_err(|e| TlogError::Serialization(e.to_string()))
}

impl CoseSign1 {
    /// Parses the envelope structure. Untagged envelopes are accepted.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let body = match bytes.split_first() {
            Some((&COSE_SIGN1_TAG, rest)) => rest,
            _ => bytes,
        };

        let (protected, _unprotected, payload, signature): WireSign1 =
            serde_cbor::from_slice(body).map_err(|e| malformed(e.to_string()))?;

        let header: BTreeMap<i64, Value> =
            serde_cbor::from_slice(&protected).map_err(|e| malformed(format!("protected header: {e}")))?;

        let alg = match header.get(&LABEL_ALG) {
            Some(Value::Integer(a)) => i64::try_from(*a).map_err(|_| malformed("alg out of range"))?,
            _ => return Err(malformed("protected header lacks alg")),
        };
        let kid = match header.get(&LABEL_KID) {
            Some(Value::Bytes(k)) => k.clone(),
            _ => return Err(malformed("protected header lacks kid")),
        };
        let content_type = match header.get(&LABEL_CONTENT_TYPE) {
            Some(Value::Text(t)) => t.clone(),
            _ => return Err(malformed("protected header lacks content type")),
        };

        Ok(Self {
            protected: protected.into_vec(),
            alg,
            kid,
            content_type,
            payload: payload.into_vec(),
            signature: signature.into_vec(),
        })
    }

    pub fn key_id(&self) -> &[u8] {
        &self.kid
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Checks algorithm, key id and signature against `key`.
    pub fn verify_signature(&self, key: &VerifyingKey) -> Result<()> {
        if self.alg != COSE_ALG_EDDSA {
            return Err(TlogError::Signature(format!(
                "unsupported algorithm {}",
                self.alg
            )));
        }
        if self.kid.as_slice() != key_id(key).as_slice() {
            return Err(TlogError::Signature(
                "key id does not match the trusted key".into(),
            ));
        }
        let signature = Signature::from_slice(&self.signature)
            .map_err(|_| TlogError::Signature("signature has the wrong length".into()))?;
        let tbs = sig_structure(&self.protected, &self.payload)?;
        key.verify_strict(&tbs, &signature)
            .map_err(|_| TlogError::Signature("signature verification failed".into()))
    }
}

/// Signs `claims` into a tagged COSE_Sign1 envelope.
pub fn sign<C: Claims>(claims: &C, key: &SigningKey) -> Result<Vec<u8>> {
    claims.validate()?;

    let payload =
        serde_cbor::to_vec(claims).map_err(|e| TlogError::Serialization(e.to_string()))?;

    let mut header = BTreeMap::new();
    header.insert(LABEL_ALG, Value::Integer(i128::from(COSE_ALG_EDDSA)));
    header.insert(
        LABEL_CONTENT_TYPE,
        Value::Text(C::KIND.content_type().to_string()),
    );
    header.insert(LABEL_KID, Value::Bytes(key_id(&key.verifying_key()).to_vec()));
    let protected =
        serde_cbor::to_vec(&header).map_err(|e| TlogError::Serialization(e.to_string()))?;

    let signature = key.sign(&sig_structure(&protected, &payload)?);

    let wire: WireSign1 = (
        ByteBuf::from(protected),
        Value::Map(BTreeMap::new()),
        ByteBuf::from(payload),
        ByteBuf::from(signature.to_bytes().to_vec()),
    );
    let body = serde_cbor::to_vec(&wire).map_err(|e| TlogError::Serialization(e.to_string()))?;

    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(COSE_SIGN1_TAG);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Verifies an envelope of kind `C::KIND` under `key` and returns its claims.
///
/// Bad structure or signature is a `Signature` error; a well-signed envelope
/// of the wrong kind or with invalid claims is `MalformedClaims`.
pub fn verify<C: Claims>(bytes: &[u8], key: &VerifyingKey) -> Result<C> {
    let envelope = CoseSign1::decode(bytes)?;
    envelope.verify_signature(key)?;
    decode_claims(&envelope)
}

/// Decodes and validates the claims of an envelope whose signature was already checked.
pub(crate) fn decode_claims<C: Claims>(envelope: &CoseSign1) -> Result<C> {
    if envelope.content_type != C::KIND.content_type() {
        return Err(TlogError::MalformedClaims(format!(
            "expected {} payload, found {:?}",
            C::KIND.content_type(),
            envelope.content_type
        )));
    }
    let claims: C = serde_cbor::from_slice(&envelope.payload)
        .map_err(|e| TlogError::MalformedClaims(e.to_string()))?;
    claims.validate()?;
    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::claims::{StatementClaims, TreeHeadClaims};
    use crate::crypto::empty_root;
    use rand_core::OsRng;

    fn statement() -> StatementClaims {
        StatementClaims {
            issuer: "did:example:builder".into(),
            subject: "pkg:cargo/tlog@0.1.0".into(),
            issued_at: 1_700_000_000,
            payload_type: Some("application/vnd.in-toto+json".into()),
            payload_digest: vec![0xab; 32],
        }
    }

    #[test]
    fn sign_then_verify() {
        let key = SigningKey::generate(&mut OsRng);
        let bytes = sign(&statement(), &key).unwrap();
        assert_eq!(bytes[0], COSE_SIGN1_TAG);

        let claims: StatementClaims = verify(&bytes, &key.verifying_key()).unwrap();
        assert_eq!(claims, statement());

        let env = CoseSign1::decode(&bytes).unwrap();
        assert_eq!(
            PayloadKind::from_content_type(env.content_type()),
            Some(PayloadKind::Statement)
        );
        assert_eq!(env.key_id(), key_id(&key.verifying_key()).as_slice());
    }

    #[test]
    fn untagged_envelope_is_accepted() {
        let key = SigningKey::generate(&mut OsRng);
        let bytes = sign(&statement(), &key).unwrap();
        let claims: StatementClaims = verify(&bytes[1..], &key.verifying_key()).unwrap();
        assert_eq!(claims.subject, "pkg:cargo/tlog@0.1.0");
    }

    #[test]
    fn wrong_key_is_signature_error() {
        let key = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let bytes = sign(&statement(), &key).unwrap();
        assert!(matches!(
            verify::<StatementClaims>(&bytes, &other.verifying_key()),
            Err(TlogError::Signature(_))
        ));
    }

    #[test]
    fn flipped_signature_byte_is_signature_error() {
        let key = SigningKey::generate(&mut OsRng);
        let mut bytes = sign(&statement(), &key).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(matches!(
            verify::<StatementClaims>(&bytes, &key.verifying_key()),
            Err(TlogError::Signature(_))
        ));
    }

    #[test]
    fn garbage_is_signature_error() {
        let key = SigningKey::generate(&mut OsRng);
        assert!(matches!(
            verify::<StatementClaims>(b"not cbor at all", &key.verifying_key()),
            Err(TlogError::Signature(_))
        ));
    }

    #[test]
    fn kinds_are_not_confusable() {
        let key = SigningKey::generate(&mut OsRng);
        let head = TreeHeadClaims {
            origin: "example.com/log".into(),
            tree_size: 0,
            root_hash: empty_root(),
            timestamp: 1,
        };
        let bytes = sign(&head, &key).unwrap();
        assert!(matches!(
            verify::<StatementClaims>(&bytes, &key.verifying_key()),
            Err(TlogError::MalformedClaims(_))
        ));
    }

    #[test]
    fn well_signed_malformed_claims() {
        // Sign a payload by hand that bypasses StatementClaims::validate.
        let key = SigningKey::generate(&mut OsRng);
        let mut header = BTreeMap::new();
        header.insert(LABEL_ALG, Value::Integer(i128::from(COSE_ALG_EDDSA)));
        header.insert(
            LABEL_CONTENT_TYPE,
            Value::Text(PayloadKind::Statement.content_type().into()),
        );
        header.insert(LABEL_KID, Value::Bytes(key_id(&key.verifying_key()).to_vec()));
        let protected = serde_cbor::to_vec(&header).unwrap();

        let mut bad = statement();
        bad.payload_digest = vec![1, 2, 3];
        let payload = serde_cbor::to_vec(&bad).unwrap();
        let signature = key.sign(&sig_structure(&protected, &payload).unwrap());
        let wire: WireSign1 = (
            ByteBuf::from(protected),
            Value::Map(BTreeMap::new()),
            ByteBuf::from(payload),
            ByteBuf::from(signature.to_bytes().to_vec()),
        );
        let bytes = serde_cbor::to_vec(&wire).unwrap();

        assert!(matches!(
            verify::<StatementClaims>(&bytes, &key.verifying_key()),
            Err(TlogError::MalformedClaims(_))
        ));
    }
}
