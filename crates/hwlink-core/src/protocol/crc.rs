//! Frame checksum
//!
//! The device firmware runs a bit-serial XMODEM update (polynomial 0x1021,
//! initial value 0) and flushes two zero bytes at the end. That augmented form
//! produces exactly the CRC-16/XMODEM value, so the table-driven
//! implementation from the `crc` crate is used here.

use crc::{Crc, CRC_16_XMODEM};

const XMODEM: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// CRC-16/XMODEM of `data`.
pub fn crc16(data: &[u8]) -> u16 {
    XMODEM.checksum(data)
}

/// CRC-16/XMODEM over several slices, as if they were concatenated.
pub fn crc16_parts(parts: &[&[u8]]) -> u16 {
    let mut digest = XMODEM.digest();
    for part in parts {
        digest.update(part);
    }
    digest.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bit-serial update as done on the device.
    fn update_bitwise(crc: u32, byte: u8) -> u32 {
        let mut input = u32::from(byte) | 0x100;
        let mut crc = crc;
        loop {
            crc <<= 1;
            input <<= 1;
            if input & 0x100 != 0 {
                crc += 1;
            }
            if crc & 0x10000 != 0 {
                crc ^= 0x1021;
            }
            if input & 0x10000 != 0 {
                break;
            }
        }
        crc & 0xFFFF
    }

    fn crc16_bitwise(data: &[u8]) -> u16 {
        let mut crc = 0;
        for &b in data {
            crc = update_bitwise(crc, b);
        }
        crc = update_bitwise(crc, 0);
        crc = update_bitwise(crc, 0);
        crc as u16
    }

    #[test]
    fn test_check_value() {
        assert_eq!(crc16(b"123456789"), 0x31C3);
        assert_eq!(crc16(&[]), 0);
    }

    #[test]
    fn test_matches_device_bitwise_update() {
        let samples: [&[u8]; 5] = [
            b"",
            b"\x00",
            b"\xAA\x55",
            b"123456789",
            &[0xFF; 64],
        ];
        for sample in samples {
            assert_eq!(crc16(sample), crc16_bitwise(sample), "sample {:02x?}", sample);
        }
    }

    #[test]
    fn test_parts_equal_whole() {
        assert_eq!(crc16_parts(&[b"1234", b"", b"56789"]), crc16(b"123456789"));
    }
}
