//! Modbus CRC16 as it appears inside SAJ frames.

const POLY: u16 = 0xA001;

/// Compute the Modbus CRC16 of `data`, byte-swapped.
///
/// The classic algorithm (polynomial 0xA001, initial value 0xFFFF) yields the
/// low byte first on the wire. SAJ frames store the checksum as a big-endian
/// `u16`, so the two bytes are swapped here: writing the result with
/// `to_be_bytes` produces the usual Modbus RTU byte order.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;

    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ POLY;
            } else {
                crc >>= 1;
            }
        }
    }

    crc.swap_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_reference_corpus() {
        // (input, swapped CRC-16/MODBUS)
        let corpus: [(&[u8], u16); 7] = [
            (&[], 0xFFFF),
            (b"123456789", 0x374B),
            (&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01], 0x840A),
            (&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A], 0xC5CD),
            (&[0x11, 0x03, 0x00, 0x6B, 0x00, 0x03], 0x7687),
            (&[0x01, 0x03, 0x40, 0xA5, 0x00, 0x01], 0x81E9),
            (&[0x01, 0x06, 0x32, 0x49, 0x00, 0x64], 0x574F),
        ];

        for (input, expected) in corpus {
            assert_eq!(crc16(input), expected, "input {:02x?}", input);
        }
    }

    #[test]
    fn test_crc16_matches_rtu_wire_order() {
        // A textbook RTU frame: 01 03 00 00 00 01 84 0A
        let crc = crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(crc.to_be_bytes(), [0x84, 0x0A]);
    }

    #[test]
    fn test_crc16_detects_single_bit_flip() {
        let data = [0x01, 0x03, 0x02, 0x01, 0x2C];
        let mut flipped = data;
        flipped[3] ^= 0x01;
        assert_ne!(crc16(&data), crc16(&flipped));
    }
}
