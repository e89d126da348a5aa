//! Base62 encoding of mapping ids into public tokens.

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const BASE: u64 = ALPHABET.len() as u64;

/// Encode `id` most-significant digit first. `0` encodes to `"a"`.
pub fn encode(mut id: u64) -> String {
    if id == 0 {
        return (ALPHABET[0] as char).to_string();
    }

    let mut digits = Vec::with_capacity(11);
    while id > 0 {
        digits.push(ALPHABET[(id % BASE) as usize]);
        id /= BASE;
    }
    digits.reverse();

    // Alphabet is pure ASCII
    digits.into_iter().map(char::from).collect()
}

/// Inverse of [`encode`]. Returns `None` for empty input, characters outside
/// the alphabet, leading zero digits, or values that overflow `u64`.
pub fn decode(token: &str) -> Option<u64> {
    let bytes = token.as_bytes();
    if bytes.is_empty() || (bytes.len() > 1 && bytes[0] == ALPHABET[0]) {
        return None;
    }

    bytes.iter().try_fold(0u64, |acc, b| {
        let digit = ALPHABET.iter().position(|c| c == b)? as u64;
        acc.checked_mul(BASE)?.checked_add(digit)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn known_values() {
        assert_eq!(encode(0), "a");
        assert_eq!(encode(1), "b");
        assert_eq!(encode(61), "9");
        assert_eq!(encode(62), "ba");
        assert_eq!(encode(543643), "crAB");
    }

    #[test]
    fn distinct_ids_give_distinct_tokens() {
        let tokens: HashSet<String> = [0u64, 1, 61, 62, 543643].into_iter().map(encode).collect();
        assert_eq!(tokens.len(), 5);
    }

    #[test]
    fn length_never_shrinks() {
        let mut last = 0;
        for id in (0..200_000u64).step_by(97) {
            let len = encode(id).len();
            assert!(len >= last);
            last = len;
        }
    }

    #[test]
    fn decode_inverts_encode() {
        for id in [0u64, 1, 61, 62, 3843, 3844, 543643, u64::MAX] {
            assert_eq!(decode(&encode(id)), Some(id));
        }
    }

    #[test]
    fn decode_rejects_foreign_input() {
        assert_eq!(decode(""), None);
        assert_eq!(decode("ab"), None);
        assert_eq!(decode("a-b"), None);
        assert_eq!(decode("9999999999999"), None);
    }
}
