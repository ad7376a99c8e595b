use flowprobe_common::FlowKey;

// ============================================================================
// CRC32C (Castagnoli), reflected, no pre/post inversion
// ============================================================================

const CRC32C_POLY: u32 = 0x82F6_3B78;

const CRC32C_TABLE: [u32; 256] = build_table();

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC32C_POLY
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

#[inline]
fn crc32c_u8(crc: u32, byte: u8) -> u32 {
    CRC32C_TABLE[((crc ^ byte as u32) & 0xff) as usize] ^ (crc >> 8)
}

#[inline]
fn crc32c_4byte_soft(data: u32, init: u32) -> u32 {
    data.to_le_bytes()
        .iter()
        .fold(init, |crc, byte| crc32c_u8(crc, *byte))
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse4.2")]
unsafe fn crc32c_4byte_hw(data: u32, init: u32) -> u32 {
    core::arch::x86_64::_mm_crc32_u32(init, data)
}

/// Fold one 32-bit word into `init`. Same result as the SSE4.2 `crc32`
/// instruction, which is used when the CPU has it.
#[inline]
pub fn crc32c_4byte(data: u32, init: u32) -> u32 {
    #[cfg(target_arch = "x86_64")]
    {
        if std::is_x86_feature_detected!("sse4.2") {
            // SAFETY: the required target feature was detected at runtime
            return unsafe { crc32c_4byte_hw(data, init) };
        }
    }
    crc32c_4byte_soft(data, init)
}

/// Order-sensitive hash of the key fields that select a bucket.
///
/// vlan_id and the padding fields do not take part.
#[inline]
pub fn bucket_hash(key: &FlowKey, seed: u32) -> u32 {
    let mut h = crc32c_4byte(key.proto as u32, seed);
    h = crc32c_4byte(key.ip_src, h);
    h = crc32c_4byte(key.ip_dst, h);
    h = crc32c_4byte(key.port_src as u32, h);
    crc32c_4byte(key.port_dst as u32, h)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32c_check_value() {
        // Standard CRC-32C check: init and xorout of all ones
        let crc = b"123456789"
            .iter()
            .fold(!0u32, |crc, byte| crc32c_u8(crc, *byte));
        assert_eq!(!crc, 0xE306_9283);
    }

    #[test]
    fn test_hardware_and_software_paths_agree() {
        let words = [0u32, 1, 6, 17, 0x0100_000a, 0xdead_beef, u32::MAX];
        for (i, &w) in words.iter().enumerate() {
            let init = (i as u32).wrapping_mul(0x9e37_79b9);
            assert_eq!(crc32c_4byte(w, init), crc32c_4byte_soft(w, init));
        }
    }

    #[test]
    fn test_bucket_hash_is_seeded_and_field_order_sensitive() {
        let key = FlowKey {
            ip_src: u32::from_ne_bytes([10, 0, 0, 1]),
            ip_dst: u32::from_ne_bytes([10, 0, 0, 2]),
            port_src: 1234u16.to_be(),
            port_dst: 80u16.to_be(),
            proto: 6,
            ..Default::default()
        };
        let swapped = FlowKey {
            ip_src: key.ip_dst,
            ip_dst: key.ip_src,
            ..key
        };
        assert_eq!(bucket_hash(&key, 0), bucket_hash(&key, 0));
        assert_ne!(bucket_hash(&key, 0), bucket_hash(&key, 1));
        assert_ne!(bucket_hash(&key, 0), bucket_hash(&swapped, 0));

        let tagged = FlowKey {
            vlan_id: Some(100),
            ..key
        };
        assert_eq!(bucket_hash(&key, 0), bucket_hash(&tagged, 0));
    }
}
