//! Frame checksum algorithms from ISO/IEC 14443-3, JIS X 6319-4 and
//! ISO/IEC 15693-3.

/// CRC-A, ISO/IEC 14443-3 type A.
pub const CRC_A_ALG: crc::Algorithm<u16> = crc::Algorithm {
    width: 16,
    poly: 0x1021,
    init: 0xC6C6,
    refin: true,
    refout: true,
    xorout: 0x0000,
    check: 0xBF05,
    residue: 0x0000,
};

/// CRC-B, ISO/IEC 14443-3 type B (X.25 family).
pub const CRC_B_ALG: crc::Algorithm<u16> = crc::Algorithm {
    width: 16,
    poly: 0x1021,
    init: 0xFFFF,
    refin: true,
    refout: true,
    xorout: 0xFFFF,
    check: 0x906E,
    residue: 0xF0B8,
};

/// CRC-F, JIS X 6319-4 (FeliCa), transmitted big-endian.
pub const CRC_F_ALG: crc::Algorithm<u16> = crc::Algorithm {
    width: 16,
    poly: 0x1021,
    init: 0x0000,
    refin: false,
    refout: false,
    xorout: 0x0000,
    check: 0x31C3,
    residue: 0x0000,
};

pub fn crc_a(input: &[u8]) -> u16 {
    let crc = crc::Crc::<u16>::new(&CRC_A_ALG);
    let mut digest = crc.digest();
    digest.update(input);
    digest.finalize()
}

pub fn crc_b(input: &[u8]) -> u16 {
    let crc = crc::Crc::<u16>::new(&CRC_B_ALG);
    let mut digest = crc.digest();
    digest.update(input);
    digest.finalize()
}

pub fn crc_f(input: &[u8]) -> u16 {
    let crc = crc::Crc::<u16>::new(&CRC_F_ALG);
    let mut digest = crc.digest();
    digest.update(input);
    digest.finalize()
}

/// CRC for ISO/IEC 15693-3 frames; same algorithm family as CRC-B.
pub fn crc_v(input: &[u8]) -> u16 {
    crc_b(input)
}

/// Check a frame whose last two bytes carry its CRC little-endian.
pub fn check_trailing_le(data: &[u8], crc: fn(&[u8]) -> u16) -> bool {
    if data.len() < 3 {
        return false;
    }
    let (body, tail) = data.split_at(data.len() - 2);
    crc(body) == u16::from_le_bytes([tail[0], tail[1]])
}

/// Check a frame whose last two bytes carry its CRC big-endian.
pub fn check_trailing_be(data: &[u8], crc: fn(&[u8]) -> u16) -> bool {
    if data.len() < 3 {
        return false;
    }
    let (body, tail) = data.split_at(data.len() - 2);
    crc(body) == u16::from_be_bytes([tail[0], tail[1]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_check_vectors() {
        assert_eq!(crc_a("123456789".as_bytes()), 0xBF05);
        assert_eq!(crc_b("123456789".as_bytes()), 0x906E);
        assert_eq!(crc_f("123456789".as_bytes()), 0x31C3);
        assert_eq!(crc_v("123456789".as_bytes()), 0x906E);
    }

    #[test]
    fn trailing_le_roundtrip() {
        let mut frame = vec![0x93u8, 0x20];
        let crc = crc_a(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        assert!(check_trailing_le(&frame, crc_a));
        frame[0] ^= 0x01;
        assert!(!check_trailing_le(&frame, crc_a));
    }

    #[test]
    fn trailing_be_roundtrip() {
        let mut frame = vec![0x06u8, 0x00, 0xFF, 0xFF, 0x00, 0x00];
        let crc = crc_f(&frame);
        frame.extend_from_slice(&crc.to_be_bytes());
        assert!(check_trailing_be(&frame, crc_f));
        frame[1] ^= 0x10;
        assert!(!check_trailing_be(&frame, crc_f));
    }
}
