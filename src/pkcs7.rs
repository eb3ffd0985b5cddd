//! Contains just enough DER walking to pull the signing certificate out of a
//! v1 signature block (`META-INF/*.RSA`, a PKCS#7 `SignedData`).
use thiserror::Error;

const TAG_SEQUENCE: u8 = 0x30;
const TAG_OID: u8 = 0x06;
const TAG_CONTEXT_0: u8 = 0xA0;

// 1.2.840.113549.1.7.2
const OID_SIGNED_DATA: &[u8] = &[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x07, 0x02];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("truncated DER data")]
    Truncated,
    #[error("unsupported DER length encoding")]
    UnsupportedLength,
    #[error("expected tag {expected:#04x}, found {found:#04x}")]
    UnexpectedTag { expected: u8, found: u8 },
    #[error("not a PKCS#7 signedData block")]
    NotSignedData,
    #[error("signature block carries no certificate")]
    NoCertificate,
}

struct Tlv<'a> {
    tag: u8,
    body: &'a [u8],
    /// Tag, length and body together
    raw: &'a [u8],
}

/// Splits the first TLV off `data`, returning it and what follows.
fn read_tlv(data: &[u8]) -> Result<(Tlv<'_>, &[u8]), SignatureError> {
    let tag = *data.first().ok_or(SignatureError::Truncated)?;
    let first = *data.get(1).ok_or(SignatureError::Truncated)?;
    let (len, header) = match first {
        0x00..=0x7F => (first as usize, 2),
        0x81..=0x84 => {
            let count = (first & 0x7F) as usize;
            let bytes = data.get(2..2 + count).ok_or(SignatureError::Truncated)?;
            (bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize), 2 + count)
        }
        // indefinite (BER) and oversized lengths
        _ => return Err(SignatureError::UnsupportedLength),
    };
    let end = header.checked_add(len).ok_or(SignatureError::UnsupportedLength)?;
    if data.len() < end {
        return Err(SignatureError::Truncated);
    }
    Ok((Tlv { tag, body: &data[header..end], raw: &data[..end] }, &data[end..]))
}

fn expect(data: &[u8], expected: u8) -> Result<(Tlv<'_>, &[u8]), SignatureError> {
    let (tlv, rest) = read_tlv(data)?;
    if tlv.tag != expected {
        return Err(SignatureError::UnexpectedTag { expected, found: tlv.tag });
    }
    Ok((tlv, rest))
}

/// DER bytes of the first certificate in a PKCS#7 signature block.
pub fn signing_certificate(block: &[u8]) -> Result<&[u8], SignatureError> {
    let (content_info, _) = expect(block, TAG_SEQUENCE)?;
    let (oid, rest) = expect(content_info.body, TAG_OID)?;
    if oid.body != OID_SIGNED_DATA {
        return Err(SignatureError::NotSignedData);
    }
    let (explicit, _) = expect(rest, TAG_CONTEXT_0)?;
    let (signed_data, _) = expect(explicit.body, TAG_SEQUENCE)?;

    // version, digestAlgorithms, contentInfo, then [0] IMPLICIT certificates
    let mut fields = signed_data.body;
    while !fields.is_empty() {
        let (field, rest) = read_tlv(fields)?;
        if field.tag == TAG_CONTEXT_0 {
            let (certificate, _) = expect(field.body, TAG_SEQUENCE)?;
            return Ok(certificate.raw);
        }
        fields = rest;
    }
    Err(SignatureError::NoCertificate)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn tlv(tag: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![tag];
        match body.len() {
            len @ 0..=0x7F => out.push(len as u8),
            len @ 0x80..=0xFF => out.extend_from_slice(&[0x81, len as u8]),
            len => out.extend_from_slice(&[0x82, (len >> 8) as u8, len as u8]),
        }
        out.extend_from_slice(body);
        out
    }

    /// Minimal `ContentInfo { signedData }` around the given certificate.
    pub(crate) fn signed_data_block(certificate: &[u8]) -> Vec<u8> {
        let version = tlv(0x02, &[0x01]);
        let digest_algorithms = tlv(0x31, &[]);
        let content = tlv(TAG_SEQUENCE, &tlv(TAG_OID, &[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x07, 0x01]));
        let certificates = tlv(TAG_CONTEXT_0, certificate);
        let signer_infos = tlv(0x31, &[]);
        let signed_data = tlv(TAG_SEQUENCE, &[version, digest_algorithms, content, certificates, signer_infos].concat());
        tlv(TAG_SEQUENCE, &[tlv(TAG_OID, OID_SIGNED_DATA), tlv(TAG_CONTEXT_0, &signed_data)].concat())
    }

    /// Stand-in certificate: a SEQUENCE long enough to need a two-byte length.
    pub(crate) fn fake_certificate() -> Vec<u8> {
        tlv(TAG_SEQUENCE, &tlv(0x04, &[0x5A; 200]))
    }

    #[test]
    fn finds_the_first_certificate() {
        let certificate = fake_certificate();
        let second = tlv(TAG_SEQUENCE, &[0x05, 0x00]);
        let block = signed_data_block(&[certificate.clone(), second].concat());
        assert_eq!(signing_certificate(&block).unwrap(), certificate.as_slice());
    }

    #[test]
    fn rejects_blocks_that_are_not_signed_data() {
        assert_eq!(signing_certificate(b"\x04\x01a"), Err(SignatureError::UnexpectedTag { expected: 0x30, found: 0x04 }));
        let data_oid = tlv(TAG_SEQUENCE, &tlv(TAG_OID, &[0x2A, 0x86, 0x48, 0x86, 0xF7, 0x0D, 0x01, 0x07, 0x01]));
        assert_eq!(signing_certificate(&data_oid), Err(SignatureError::NotSignedData));
        let mut truncated = signed_data_block(&fake_certificate());
        truncated.truncate(40);
        assert_eq!(signing_certificate(&truncated), Err(SignatureError::Truncated));
    }

    #[test]
    fn block_without_certificates_is_reported() {
        let signed_data = tlv(TAG_SEQUENCE, &[tlv(0x02, &[0x01]), tlv(0x31, &[])].concat());
        let block = tlv(TAG_SEQUENCE, &[tlv(TAG_OID, OID_SIGNED_DATA), tlv(TAG_CONTEXT_0, &signed_data)].concat());
        assert_eq!(signing_certificate(&block), Err(SignatureError::NoCertificate));
    }
}
