use bytesstr::BytesStr;
use rand::{Rng, distr::Alphanumeric, rng};

pub(crate) fn random_string() -> BytesStr {
    rng()
        .sample_iter(Alphanumeric)
        .take(30)
        .map(char::from)
        .collect::<String>()
        .into()
}

pub(crate) fn random_sequence_number() -> u32 {
    rand::rng().random_range(0..(u32::MAX >> 1))
}

/// Initial RSeq value of a reliable provisional sequence, RFC 3262
/// recommends choosing it from `[1, 2**15]`.
pub(crate) fn random_rseq() -> u32 {
    rand::rng().random_range(1..=0x7FFF)
}

pub(crate) fn random_ssrc() -> u32 {
    rand::rng().random()
}

/// Decode %XX escapes, leaving malformed escapes untouched
pub(crate) fn percent_decode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();

    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let escaped = input
                .get(i + 1..i + 3)
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());

            if let Some(byte) = escaped {
                out.push(byte as char);
                i += 3;
                continue;
            }
        }

        out.push(bytes[i] as char);
        i += 1;
    }

    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn percent_decoding() {
        assert_eq!(percent_decode("abc"), "abc");
        assert_eq!(percent_decode("a%3Bb%3Dc"), "a;b=c");
        assert_eq!(percent_decode("50%"), "50%");
    }

    #[test]
    fn rseq_start_is_within_rfc_window() {
        for _ in 0..64 {
            let rseq = random_rseq();
            assert!((1..=0x7FFF).contains(&rseq));
        }
    }
}
