//! Tryte-encoded address and seed formats.

/// Characters of the tryte alphabet.
pub const TRYTE_ALPHABET: &[u8; 27] = b"9ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Length of an address without checksum.
pub const ADDRESS_LENGTH: usize = 81;

/// Length of an address with its 9-tryte checksum.
pub const ADDRESS_WITH_CHECKSUM_LENGTH: usize = 90;

/// Maximum seed length.
pub const SEED_LENGTH: usize = 81;

pub fn is_trytes(value: &str) -> bool {
    value.bytes().all(|b| TRYTE_ALPHABET.contains(&b))
}

pub fn is_valid_address(address: &str) -> bool {
    matches!(address.len(), ADDRESS_LENGTH | ADDRESS_WITH_CHECKSUM_LENGTH) && is_trytes(address)
}

pub fn is_valid_seed(seed: &str) -> bool {
    !seed.is_empty() && seed.len() <= SEED_LENGTH && is_trytes(seed)
}

/// Strip the checksum of an address, if present.
pub fn no_checksum(address: &str) -> &str {
    if address.len() == ADDRESS_WITH_CHECKSUM_LENGTH {
        &address[..ADDRESS_LENGTH]
    } else {
        address
    }
}

/// Map arbitrary bytes onto `len` trytes.
pub fn bytes_to_trytes(bytes: &[u8], len: usize) -> String {
    bytes
        .iter()
        .cycle()
        .take(len)
        .map(|b| TRYTE_ALPHABET[(*b as usize) % TRYTE_ALPHABET.len()] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_lengths() {
        assert!(is_valid_address(&"A".repeat(81)));
        assert!(is_valid_address(&"9".repeat(90)));
        assert!(!is_valid_address(&"A".repeat(80)));
        assert!(!is_valid_address(&"a".repeat(81)));
    }

    #[test]
    fn test_seed() {
        assert!(is_valid_seed("SEED9"));
        assert!(!is_valid_seed(""));
        assert!(!is_valid_seed(&"A".repeat(82)));
        assert!(!is_valid_seed("seed"));
    }

    #[test]
    fn test_no_checksum() {
        let with = format!("{}{}", "A".repeat(81), "B".repeat(9));
        assert_eq!(no_checksum(&with), "A".repeat(81));
        assert_eq!(no_checksum(&"C".repeat(81)), "C".repeat(81));
    }

    #[test]
    fn test_bytes_to_trytes() {
        let trytes = bytes_to_trytes(&[0, 1, 26, 27], 81);
        assert_eq!(trytes.len(), 81);
        assert!(trytes.starts_with("9AZ9"));
        assert!(is_trytes(&trytes));
    }
}
