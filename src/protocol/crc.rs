//! CRC-16 used for both the header checksum and the frame checksum.
//!
//! Polynomial 0x1021, initial value 0x0000, no reflection, no final XOR
//! (the "XMODEM" parameter set).

const POLY: u16 = 0x1021;

/// CRC-16 over `bytes`.
pub fn crc16(bytes: &[u8]) -> u16 {
    crc16_update(0, bytes)
}

/// Continue a CRC computation over another chunk.
///
/// `crc16_update(crc16(a), b) == crc16(a ‖ b)`, which lets the payload and
/// the security tag be checksummed without concatenating them.
pub fn crc16_update(mut crc: u16, bytes: &[u8]) -> u16 {
    for &b in bytes {
        crc ^= (b as u16) << 8;
        for _ in 0..8 {
            if (crc & 0x8000) != 0 {
                crc = (crc << 1) ^ POLY;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        assert_eq!(crc16(b"123456789"), 0x31C3);
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(crc16(&[]), 0);
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let data = b"hello cpc link layer";
        let (a, b) = data.split_at(7);
        assert_eq!(crc16_update(crc16(a), b), crc16(data));
    }
}
