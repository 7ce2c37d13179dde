use crate::database::CertifiedKey;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

const BEGIN: &str = "-----BEGIN CERTIFICATE-----\n";
const END: &str = "-----END CERTIFICATE-----";
const LINE_WIDTH: usize = 64;

pub fn pem_certificate(der: &[u8]) -> String {
    let encoded = STANDARD.encode(der);
    let mut pem = String::with_capacity(BEGIN.len() + END.len() + encoded.len() * 65 / 64 + 1);
    pem.push_str(BEGIN);
    // Base64 output is ASCII, so byte chunks are char boundaries.
    for line in encoded.as_bytes().chunks(LINE_WIDTH) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str(END);
    pem
}

/// Leaf, intermediate, then any additional intermediates, joined by `\n`.
/// Empty when the key has no certificate yet.
pub fn certificate_chain(key: &CertifiedKey) -> String {
    if key.certified_key_credential.is_empty() {
        return String::new();
    }
    std::iter::once(&key.certified_key_credential)
        .chain(Some(&key.intermediate_ca_cert).filter(|cert| !cert.is_empty()))
        .chain(key.additional_intermediate_ca_cert.iter())
        .map(|der| pem_certificate(der))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_at_64_columns() {
        let pem = pem_certificate(&[0xAB; 60]);
        let lines: Vec<&str> = pem.lines().collect();
        assert_eq!(lines[0], "-----BEGIN CERTIFICATE-----");
        assert_eq!(lines[1].len(), 64);
        assert_eq!(lines[2].len(), 16);
        assert_eq!(lines[3], "-----END CERTIFICATE-----");
        assert!(!pem.ends_with('\n'));
    }

    #[test]
    fn chain_order_and_separator() {
        let key = CertifiedKey {
            certified_key_credential: b"leaf".to_vec(),
            intermediate_ca_cert: b"mid".to_vec(),
            additional_intermediate_ca_cert: vec![b"extra".to_vec()],
            ..Default::default()
        };
        let expected = format!(
            "{}\n{}\n{}",
            pem_certificate(b"leaf"),
            pem_certificate(b"mid"),
            pem_certificate(b"extra")
        );
        assert_eq!(certificate_chain(&key), expected);
        assert_eq!(
            pem_certificate(b"leaf"),
            "-----BEGIN CERTIFICATE-----\nbGVhZg==\n-----END CERTIFICATE-----"
        );
    }

    #[test]
    fn no_leaf_no_chain() {
        let key = CertifiedKey {
            intermediate_ca_cert: b"mid".to_vec(),
            ..Default::default()
        };
        assert_eq!(certificate_chain(&key), "");
    }
}
