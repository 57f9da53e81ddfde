//! Wire parsing for the receive-scaling parameter set operation.
//!
//! Validation completes before any state mutation: a short buffer and an
//! invalid value are distinct failures.

use crate::RssError;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub const RSS_FLAG_DISABLE: u32 = 1 << 0;
pub const RSS_FLAG_HASH_INFO_CHANGED: u32 = 1 << 1;
pub const RSS_FLAG_TABLE_CHANGED: u32 = 1 << 2;
pub const RSS_FLAG_KEY_CHANGED: u32 = 1 << 3;

pub const HASH_TYPE_IPV4: u32 = 1 << 0;
pub const HASH_TYPE_TCP_IPV4: u32 = 1 << 1;
pub const HASH_TYPE_IPV6: u32 = 1 << 2;
pub const HASH_TYPE_TCP_IPV6: u32 = 1 << 3;

const HASH_TYPE_SUPPORTED: u32 =
    HASH_TYPE_IPV4 | HASH_TYPE_TCP_IPV4 | HASH_TYPE_IPV6 | HASH_TYPE_TCP_IPV6;

/// The only supported hash function.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum HashFunction {
    Toeplitz = 1,
}

pub const RSS_HASH_KEY_MAX: usize = 40;

/// Fixed header of the parameter payload. Sub-operation payloads follow at
/// the recorded offsets.
#[repr(C)]
#[derive(Copy, Clone, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct RssParametersHeader {
    pub flags: u32,
    /// Hash function in the low byte, hash type bits above it.
    pub hash_information: u32,
    pub indirection_table_offset: u32,
    pub indirection_table_size: u32,
    pub hash_key_offset: u32,
    pub hash_key_size: u32,
}

/// A validated parameter set.
#[derive(Clone, Debug, Default)]
pub struct RssParameters {
    pub disable: bool,
    pub hash_function: Option<u8>,
    pub hash_type: u32,
    pub hash_key: Option<Vec<u8>>,
    /// Table entries as queue numbers, indexed from zero.
    pub indirection_entries: Option<Vec<u16>>,
}

impl RssParameters {
    pub fn parse(payload: &[u8]) -> Result<Self, RssError> {
        let Ok((header, _)) = RssParametersHeader::read_from_prefix(payload) else {
            return Err(RssError::BufferTooSmall {
                needed: size_of::<RssParametersHeader>(),
                actual: payload.len(),
            });
        };

        let mut params = RssParameters {
            disable: header.flags & RSS_FLAG_DISABLE != 0,
            ..Default::default()
        };
        if params.disable {
            return Ok(params);
        }

        if header.flags & RSS_FLAG_HASH_INFO_CHANGED != 0 {
            let function = (header.hash_information & 0xff) as u8;
            if function != HashFunction::Toeplitz as u8 {
                return Err(RssError::UnsupportedHashFunction(function));
            }
            let hash_type = header.hash_information >> 8;
            if hash_type & !HASH_TYPE_SUPPORTED != 0 {
                return Err(RssError::UnsupportedHashType(hash_type));
            }
            params.hash_function = Some(function);
            params.hash_type = hash_type;
        }

        if header.flags & RSS_FLAG_TABLE_CHANGED != 0 {
            let bytes = sub_buffer(
                payload,
                header.indirection_table_offset,
                header.indirection_table_size,
            )?;
            if bytes.len() % 2 != 0 {
                return Err(RssError::InvalidParameter("odd indirection table size"));
            }
            let count = bytes.len() / 2;
            if count == 0 || !count.is_power_of_two() {
                return Err(RssError::InvalidParameter(
                    "indirection entry count must be a nonzero power of two",
                ));
            }
            params.indirection_entries = Some(
                bytes
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect(),
            );
        }

        if header.flags & RSS_FLAG_KEY_CHANGED != 0 {
            let bytes = sub_buffer(payload, header.hash_key_offset, header.hash_key_size)?;
            if bytes.is_empty() || bytes.len() > RSS_HASH_KEY_MAX {
                return Err(RssError::InvalidParameter("hash key length"));
            }
            params.hash_key = Some(bytes.to_vec());
        }

        Ok(params)
    }
}

fn sub_buffer(payload: &[u8], offset: u32, size: u32) -> Result<&[u8], RssError> {
    let offset = offset as usize;
    let size = size as usize;
    if offset < size_of::<RssParametersHeader>() {
        return Err(RssError::InvalidParameter("sub-buffer overlaps header"));
    }
    let end = offset
        .checked_add(size)
        .ok_or(RssError::InvalidParameter("sub-buffer range overflow"))?;
    if end > payload.len() {
        return Err(RssError::BufferTooSmall {
            needed: end,
            actual: payload.len(),
        });
    }
    Ok(&payload[offset..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(header: RssParametersHeader, tail: &[u8]) -> Vec<u8> {
        let mut bytes = header.as_bytes().to_vec();
        bytes.extend_from_slice(tail);
        bytes
    }

    #[test]
    fn short_buffer_is_too_small_not_invalid() {
        let err = RssParameters::parse(&[0u8; 4]).unwrap_err();
        assert!(matches!(err, RssError::BufferTooSmall { .. }));
    }

    #[test]
    fn disable_short_circuits() {
        let header = RssParametersHeader {
            flags: RSS_FLAG_DISABLE,
            hash_information: 0,
            indirection_table_offset: 0,
            indirection_table_size: 0,
            hash_key_offset: 0,
            hash_key_size: 0,
        };
        let params = RssParameters::parse(&payload(header, &[])).unwrap();
        assert!(params.disable);
    }

    #[test]
    fn unsupported_hash_function_is_rejected() {
        let header = RssParametersHeader {
            flags: RSS_FLAG_HASH_INFO_CHANGED,
            hash_information: 2,
            indirection_table_offset: 0,
            indirection_table_size: 0,
            hash_key_offset: 0,
            hash_key_size: 0,
        };
        assert!(matches!(
            RssParameters::parse(&payload(header, &[])),
            Err(RssError::UnsupportedHashFunction(2))
        ));
    }

    #[test]
    fn full_parameter_set_parses() {
        let base = size_of::<RssParametersHeader>() as u32;
        let header = RssParametersHeader {
            flags: RSS_FLAG_HASH_INFO_CHANGED | RSS_FLAG_TABLE_CHANGED | RSS_FLAG_KEY_CHANGED,
            hash_information: u32::from(HashFunction::Toeplitz as u8)
                | (HASH_TYPE_TCP_IPV4 << 8),
            indirection_table_offset: base,
            indirection_table_size: 8,
            hash_key_offset: base + 8,
            hash_key_size: 4,
        };
        let mut tail = Vec::new();
        for queue in [0u16, 1, 0, 1] {
            tail.extend_from_slice(&queue.to_le_bytes());
        }
        tail.extend_from_slice(&[0xaa; 4]);
        let params = RssParameters::parse(&payload(header, &tail)).unwrap();
        assert_eq!(params.hash_function, Some(1));
        assert_eq!(params.hash_type, HASH_TYPE_TCP_IPV4);
        assert_eq!(params.indirection_entries, Some(vec![0, 1, 0, 1]));
        assert_eq!(params.hash_key, Some(vec![0xaa; 4]));
    }

    #[test]
    fn truncated_table_is_too_small() {
        let base = size_of::<RssParametersHeader>() as u32;
        let header = RssParametersHeader {
            flags: RSS_FLAG_TABLE_CHANGED,
            hash_information: 0,
            indirection_table_offset: base,
            indirection_table_size: 64,
            hash_key_offset: 0,
            hash_key_size: 0,
        };
        assert!(matches!(
            RssParameters::parse(&payload(header, &[0; 8])),
            Err(RssError::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn non_power_of_two_table_is_invalid() {
        let base = size_of::<RssParametersHeader>() as u32;
        let header = RssParametersHeader {
            flags: RSS_FLAG_TABLE_CHANGED,
            hash_information: 0,
            indirection_table_offset: base,
            indirection_table_size: 6,
            hash_key_offset: 0,
            hash_key_size: 0,
        };
        assert!(matches!(
            RssParameters::parse(&payload(header, &[0; 6])),
            Err(RssError::InvalidParameter(_))
        ));
    }
}
