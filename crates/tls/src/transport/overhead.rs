//! Per-record expansion estimates used for tunnel MTU sizing

/// Record framing family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordProtocol {
    Tls,
    Dtls,
}

impl RecordProtocol {
    /// Length of the record header
    pub const fn header_len(self) -> usize {
        match self {
            Self::Tls => 5,
            // adds epoch and a 48-bit sequence number
            Self::Dtls => 13,
        }
    }
}

/// Bulk cipher protecting the records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkCipher {
    Null,
    TripleDesCbc,
    Aes128Cbc,
    Aes256Cbc,
    Aes128Gcm,
    Aes256Gcm,
    Chacha20Poly1305,
}

impl BulkCipher {
    pub const fn block_size(self) -> usize {
        match self {
            Self::Null | Self::Chacha20Poly1305 => 0,
            Self::TripleDesCbc => 8,
            Self::Aes128Cbc | Self::Aes256Cbc | Self::Aes128Gcm | Self::Aes256Gcm => 16,
        }
    }

    /// Bytes the cipher adds to each record, excluding any separate MAC
    pub const fn expansion(self) -> usize {
        match self {
            Self::Null => 0,
            // explicit IV plus worst-case padding
            Self::TripleDesCbc | Self::Aes128Cbc | Self::Aes256Cbc => 2 * self.block_size(),
            // explicit nonce plus tag
            Self::Aes128Gcm | Self::Aes256Gcm => 8 + 16,
            Self::Chacha20Poly1305 => 16,
        }
    }
}

/// Record MAC, for suites that authenticate separately from the cipher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacAlgorithm {
    /// AEAD suites carry no separate MAC
    Aead,
    Sha1,
    Sha256,
    Sha384,
}

impl MacAlgorithm {
    pub const fn output_len(self) -> usize {
        match self {
            Self::Aead => 0,
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
        }
    }
}

/// Upper bound on the bytes a record adds around its payload.
pub const fn record_overhead(
    protocol: RecordProtocol,
    cipher: BulkCipher,
    mac: MacAlgorithm,
) -> usize {
    protocol.header_len() + cipher.expansion() + mac.output_len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gcm_overhead() {
        assert_eq!(
            record_overhead(RecordProtocol::Tls, BulkCipher::Aes128Gcm, MacAlgorithm::Aead),
            29
        );
        assert_eq!(
            record_overhead(RecordProtocol::Dtls, BulkCipher::Aes256Gcm, MacAlgorithm::Aead),
            37
        );
    }

    #[test]
    fn test_cbc_overhead_includes_iv_padding_and_mac() {
        assert_eq!(
            record_overhead(RecordProtocol::Dtls, BulkCipher::Aes128Cbc, MacAlgorithm::Sha1),
            13 + 32 + 20
        );
        assert_eq!(
            record_overhead(RecordProtocol::Tls, BulkCipher::TripleDesCbc, MacAlgorithm::Sha256),
            5 + 16 + 32
        );
    }

    #[test]
    fn test_null_cipher_is_header_and_mac() {
        assert_eq!(
            record_overhead(RecordProtocol::Tls, BulkCipher::Null, MacAlgorithm::Sha1),
            25
        );
    }
}
