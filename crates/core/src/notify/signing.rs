use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::event_id::encode_hex;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_PREFIX: &str = "sha256=";

/// HMAC-SHA256 over `"{timestamp}.{raw_json_payload}"`, rendered as
/// `sha256=<hex>` for the signature header.
pub fn signature_header(secret: &[u8], timestamp: i64, payload: &str) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret).ok()?;
    mac.update(format!("{timestamp}.{payload}").as_bytes());
    let digest = mac.finalize().into_bytes();
    Some(format!("{SIGNATURE_PREFIX}{}", encode_hex(digest.as_slice())))
}

/// Constant-shape verification helper for receivers and tests.
pub fn verify_signature(secret: &[u8], timestamp: i64, payload: &str, header: &str) -> bool {
    let Some(expected) = signature_header(secret, timestamp, payload) else {
        return false;
    };
    let mut mismatch = expected.len() ^ header.len();
    for (left, right) in expected.bytes().zip(header.bytes()) {
        mismatch |= (left ^ right) as usize;
    }
    mismatch == 0
}

#[cfg(test)]
mod tests {
    use super::{signature_header, verify_signature};

    const SECRET: &[u8] = b"vigil-test-secret";
    const PAYLOAD: &str = r#"{"event_type":"alert_firing","source":"train"}"#;
    const TIMESTAMP: i64 = 1_772_400_000;

    #[test]
    fn signature_is_reproducible_for_known_inputs() {
        let first = signature_header(SECRET, TIMESTAMP, PAYLOAD).expect("signature");
        let second = signature_header(SECRET, TIMESTAMP, PAYLOAD).expect("signature");

        assert_eq!(first, second);
        assert!(first.starts_with("sha256="));
        assert_eq!(first.len(), "sha256=".len() + 64);
        assert!(verify_signature(SECRET, TIMESTAMP, PAYLOAD, &first));
    }

    #[test]
    fn altering_payload_or_timestamp_changes_signature() {
        let baseline = signature_header(SECRET, TIMESTAMP, PAYLOAD).expect("signature");

        let tampered_payload =
            signature_header(SECRET, TIMESTAMP, r#"{"event_type":"alert_firing","source":"trainX"}"#)
                .expect("signature");
        assert_ne!(baseline, tampered_payload);

        let tampered_timestamp = signature_header(SECRET, TIMESTAMP + 1, PAYLOAD).expect("signature");
        assert_ne!(baseline, tampered_timestamp);
    }

    #[test]
    fn verification_rejects_wrong_secret() {
        let header = signature_header(SECRET, TIMESTAMP, PAYLOAD).expect("signature");
        assert!(!verify_signature(b"other-secret", TIMESTAMP, PAYLOAD, &header));
    }
}
