//! Serial-type codec -- maps a record header's per-column type code to its
//! storage class and on-disk content size. See
//! https://www.sqlite.org/fileformat2.html#record_format.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    Null,
    Integral,
    Real,
    Text,
    Blob,
}

/// Returns the number of content bytes a serial type occupies in a record
/// body, not counting the serial type varint itself in the header.
///
/// Serial Type | Content Size | Meaning
/// 0           | 0            | NULL
/// 1..6        | 1,2,3,4,6,8  | signed integers of increasing width
/// 7           | 8            | IEEE-754 double
/// 8,9         | 0            | constant 0 / 1
/// even >= 12  | (N-12)/2     | BLOB
/// odd  >= 13  | (N-13)/2     | TEXT
pub fn content_size(serial_type: i64) -> usize {
    match serial_type {
        0 | 8 | 9 | 10 | 11 => 0,
        1 => 1,
        2 => 2,
        3 => 3,
        4 => 4,
        5 => 6,
        6 | 7 => 8,
        x if x >= 12 && x % 2 == 0 => ((x - 12) / 2) as usize,
        x if x >= 13 => ((x - 13) / 2) as usize,
        _ => 0, // negative/reserved codes carry no body; callers reject them separately.
    }
}

/// Projects a serial type onto its SQLite storage class.
pub fn storage_class(serial_type: i64) -> StorageClass {
    match serial_type {
        0 => StorageClass::Null,
        1..=6 | 8 | 9 => StorageClass::Integral,
        7 => StorageClass::Real,
        x if x >= 12 && x % 2 == 0 => StorageClass::Blob,
        x if x >= 13 => StorageClass::Text,
        _ => StorageClass::Null,
    }
}

/// True for the reserved-for-internal-use codes 10 and 11, which never
/// appear in a well-formed database but might appear in transient files.
pub fn is_reserved(serial_type: i64) -> bool {
    serial_type == 10 || serial_type == 11
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_sizes() {
        assert_eq!(content_size(0), 0);
        assert_eq!(content_size(1), 1);
        assert_eq!(content_size(2), 2);
        assert_eq!(content_size(3), 3);
        assert_eq!(content_size(4), 4);
        assert_eq!(content_size(5), 6);
        assert_eq!(content_size(6), 8);
        assert_eq!(content_size(7), 8);
        assert_eq!(content_size(8), 0);
        assert_eq!(content_size(9), 0);
        assert_eq!(content_size(12), 0);
        assert_eq!(content_size(13), 0);
        assert_eq!(content_size(18), 3);
        assert_eq!(content_size(19), 3);
    }

    #[test]
    fn storage_classes() {
        assert_eq!(storage_class(0), StorageClass::Null);
        assert_eq!(storage_class(1), StorageClass::Integral);
        assert_eq!(storage_class(9), StorageClass::Integral);
        assert_eq!(storage_class(7), StorageClass::Real);
        assert_eq!(storage_class(18), StorageClass::Blob);
        assert_eq!(storage_class(19), StorageClass::Text);
    }
}
