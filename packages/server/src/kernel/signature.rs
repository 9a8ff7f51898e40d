//! HMAC-SHA256 signatures: webhook bodies carry `X-Signature: sha256=<hex>`,
//! stored-object URLs carry `?sig=<hex>` over the object path.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-signature";
const SCHEME_PREFIX: &str = "sha256=";

pub const OBJECT_SIGNATURE_PARAM: &str = "sig";
const OBJECT_CONTEXT: &[u8] = b"object:";

fn mac(secret: &[u8]) -> HmacSha256 {
    <HmacSha256 as Mac>::new_from_slice(secret).expect("HMAC-SHA-256 accepts keys of any size")
}

/// Sign `payload`, producing a full header value.
pub fn sign(payload: &[u8], secret: &[u8]) -> String {
    let mut mac = mac(secret);
    mac.update(payload);
    format!("{}{}", SCHEME_PREFIX, hex::encode(mac.finalize().into_bytes()))
}

/// Check a header value against `payload`.
///
/// The digest comparison is constant-time. Headers without the scheme
/// prefix, or whose digest is not 32 bytes of hex, never match.
pub fn verify(payload: &[u8], header: &str, secret: &[u8]) -> bool {
    let Some(digest_hex) = header.trim().strip_prefix(SCHEME_PREFIX) else {
        return false;
    };
    let Ok(digest) = hex::decode(digest_hex) else {
        return false;
    };

    let mut mac = mac(secret);
    mac.update(payload);
    mac.verify_slice(&digest).is_ok()
}

fn object_mac(path: &str, secret: &[u8]) -> HmacSha256 {
    let mut mac = mac(secret);
    mac.update(OBJECT_CONTEXT);
    mac.update(path.trim_start_matches('/').as_bytes());
    mac
}

/// Hex signature for a stored object's `<bucket>/<key>` path.
pub fn sign_object(path: &str, secret: &[u8]) -> String {
    hex::encode(object_mac(path, secret).finalize().into_bytes())
}

pub fn verify_object(path: &str, signature: &str, secret: &[u8]) -> bool {
    let Ok(digest) = hex::decode(signature.trim()) else {
        return false;
    };
    object_mac(path, secret).verify_slice(&digest).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"whsec_test";

    #[test]
    fn signed_payload_verifies() {
        for payload in [&b""[..], b"{}", br#"{"submissionId":"x","status":"ERROR"}"#] {
            let header = sign(payload, SECRET);
            assert!(header.starts_with("sha256="));
            assert!(verify(payload, &header, SECRET));
        }
    }

    #[test]
    fn any_changed_byte_breaks_the_signature() {
        let payload = br#"{"status":"REPORT_READY","riskScore":0.92}"#.to_vec();
        let header = sign(&payload, SECRET);

        for i in 0..payload.len() {
            let mut tampered = payload.clone();
            tampered[i] ^= 0x01;
            assert!(!verify(&tampered, &header, SECRET), "byte {} unchecked", i);
        }
    }

    #[test]
    fn wrong_secret_fails() {
        let header = sign(b"payload", SECRET);
        assert!(!verify(b"payload", &header, b"other"));
    }

    #[test]
    fn malformed_headers_fail() {
        let header = sign(b"payload", SECRET);
        let bare = header.trim_start_matches("sha256=");

        assert!(!verify(b"payload", bare, SECRET));
        assert!(!verify(b"payload", "sha256=zz", SECRET));
        assert!(!verify(b"payload", "sha256=", SECRET));
        assert!(!verify(b"payload", &header[..header.len() - 2], SECRET));
        assert!(!verify(b"payload", &format!("{}00", header), SECRET));
    }

    #[test]
    fn object_signature_is_bound_to_the_path() {
        let sig = sign_object("submissions/owner/a.wav", SECRET);

        assert!(verify_object("submissions/owner/a.wav", &sig, SECRET));
        assert!(verify_object("/submissions/owner/a.wav", &sig, SECRET));
        assert!(!verify_object("submissions/owner/b.wav", &sig, SECRET));
        assert!(!verify_object("submissions/owner/a.wav", &sig, b"other"));
        assert!(!verify_object("submissions/owner/a.wav", "not-hex", SECRET));
    }

    #[test]
    fn object_and_webhook_signatures_do_not_mix() {
        let header = sign(b"submissions/owner/a.wav", SECRET);
        let digest = header.trim_start_matches("sha256=");
        assert!(!verify_object("submissions/owner/a.wav", digest, SECRET));
    }
}
