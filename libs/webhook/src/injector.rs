//! Injector patch signature verification (`spec.md §4.7`, §6 "Injector
//! signature format"): the patch body is verified against a PEM-encoded
//! public key before it is applied, regardless of the handler's own
//! `allowed` verdict.
//!
//! `ring` is used because it already sits in the dependency graph
//! transitively through `kube`'s rustls TLS stack, so verifying a detached
//! signature doesn't pull in a second crypto library. `ring`'s RSA/Ed25519
//! verifiers take the raw key bytes out of a `SubjectPublicKeyInfo`, so a
//! small ASN.1 reader unwraps the PEM down to those bytes rather than
//! depending on a general-purpose X.509 crate for one field.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ring::signature::{self, UnparsedPublicKey};

use crate::error::{Error, Result};

const OID_ED25519: &[u8] = &[0x06, 0x03, 0x2b, 0x65, 0x70];
const OID_RSA_ENCRYPTION: &[u8] = &[0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01];

enum KeyAlgorithm {
    Ed25519,
    Rsa,
}

struct Tlv<'a> {
    tag: u8,
    content: &'a [u8],
}

fn read_length(input: &[u8]) -> Result<(usize, &[u8])> {
    let first = *input
        .first()
        .ok_or_else(|| Error::InvalidKey("truncated DER length".into()))?;
    if first & 0x80 == 0 {
        return Ok((first as usize, &input[1..]));
    }
    let octets = (first & 0x7f) as usize;
    if octets == 0 || octets > 4 || input.len() < 1 + octets {
        return Err(Error::InvalidKey("unsupported DER length encoding".into()));
    }
    let mut len = 0usize;
    for byte in &input[1..1 + octets] {
        len = (len << 8) | (*byte as usize);
    }
    Ok((len, &input[1 + octets..]))
}

fn read_tlv(input: &[u8]) -> Result<(Tlv<'_>, &[u8])> {
    let tag = *input
        .first()
        .ok_or_else(|| Error::InvalidKey("truncated DER tag".into()))?;
    let (len, rest) = read_length(&input[1..])?;
    if rest.len() < len {
        return Err(Error::InvalidKey("truncated DER content".into()));
    }
    let (content, remainder) = rest.split_at(len);
    Ok((Tlv { tag, content }, remainder))
}

/// Unwraps a DER `SubjectPublicKeyInfo` (the body of a PEM "PUBLIC KEY")
/// down to the algorithm it names and the raw key bytes `ring` expects.
fn parse_subject_public_key_info(der: &[u8]) -> Result<(KeyAlgorithm, Vec<u8>)> {
    let (outer, _) = read_tlv(der)?;
    if outer.tag != 0x30 {
        return Err(Error::InvalidKey("expected SEQUENCE at SPKI root".into()));
    }
    let (algorithm_id, rest) = read_tlv(outer.content)?;
    if algorithm_id.tag != 0x30 {
        return Err(Error::InvalidKey("expected SEQUENCE for AlgorithmIdentifier".into()));
    }
    let algorithm = if algorithm_id.content.starts_with(OID_ED25519) {
        KeyAlgorithm::Ed25519
    } else if algorithm_id.content.starts_with(OID_RSA_ENCRYPTION) {
        KeyAlgorithm::Rsa
    } else {
        return Err(Error::InvalidKey("unsupported public key algorithm".into()));
    };
    let (bit_string, _) = read_tlv(rest)?;
    if bit_string.tag != 0x03 {
        return Err(Error::InvalidKey("expected BIT STRING for subjectPublicKey".into()));
    }
    let key_bytes = bit_string
        .content
        .get(1..)
        .ok_or_else(|| Error::InvalidKey("empty subjectPublicKey bit string".into()))?
        .to_vec();
    Ok((algorithm, key_bytes))
}

fn decode_pem(pem: &str) -> Result<Vec<u8>> {
    let body: String = pem
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect();
    BASE64
        .decode(body)
        .map_err(Error::Base64)
}

/// Verifies `signature` (base64, RFC 6902 JSONPatch bytes as the message)
/// against the PEM public key at `key_path`. Fails closed on any
/// malformed input.
pub fn verify_patch(key_path: &Path, patch_bytes: &[u8], signature_b64: &str) -> Result<()> {
    let pem = std::fs::read_to_string(key_path)?;
    let der = decode_pem(&pem)?;
    let (algorithm, key_bytes) = parse_subject_public_key_info(&der)?;
    let signature = BASE64.decode(signature_b64).map_err(Error::Base64)?;

    let verified = match algorithm {
        KeyAlgorithm::Ed25519 => {
            UnparsedPublicKey::new(&signature::ED25519, &key_bytes).verify(patch_bytes, &signature)
        }
        KeyAlgorithm::Rsa => UnparsedPublicKey::new(&signature::RSA_PKCS1_2048_8192_SHA256, &key_bytes)
            .verify(patch_bytes, &signature),
    };
    verified.map_err(|_| Error::InvalidSignature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring::rand::SystemRandom;
    use ring::signature::{Ed25519KeyPair, KeyPair};
    use std::io::Write;

    fn ed25519_spki_pem(public_key: &[u8]) -> String {
        // Fixed 12-byte SPKI prefix for Ed25519 (RFC 8410), then the raw 32-byte key.
        const PREFIX: [u8; 12] = [
            0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
        ];
        let mut der = Vec::with_capacity(44);
        der.extend_from_slice(&PREFIX);
        der.extend_from_slice(public_key);
        let b64 = BASE64.encode(der);
        let mut pem = String::from("-----BEGIN PUBLIC KEY-----\n");
        for chunk in b64.as_bytes().chunks(64) {
            pem.push_str(std::str::from_utf8(chunk).unwrap());
            pem.push('\n');
        }
        pem.push_str("-----END PUBLIC KEY-----\n");
        pem
    }

    #[test]
    fn verifies_a_genuine_ed25519_signature() {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        let key_pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap();
        let message = b"[{\"op\":\"add\",\"path\":\"/metadata/labels/injected\",\"value\":\"true\"}]";
        let signature = key_pair.sign(message);

        let dir = std::env::temp_dir().join(format!("whitebox-injector-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let key_path = dir.join("key.pem");
        let mut file = std::fs::File::create(&key_path).unwrap();
        file.write_all(ed25519_spki_pem(key_pair.public_key().as_ref()).as_bytes())
            .unwrap();

        let signature_b64 = BASE64.encode(signature.as_ref());
        assert!(verify_patch(&key_path, message, &signature_b64).is_ok());

        let mut tampered = message.to_vec();
        tampered[0] = b'X';
        assert!(verify_patch(&key_path, &tampered, &signature_b64).is_err());

        std::fs::remove_dir_all(&dir).ok();
    }
}
