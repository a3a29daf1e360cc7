//! Properties block and key record decoding.
//!
//! Properties are stored as named entries so newer writers can add fields;
//! these tests pin down that unknown names are skipped and malformed known
//! ones are not.

#[cfg(test)]
mod tests {
    use crate::block::{BlockHandle, PropertyEntry};
    use crate::checkpoint::properties::*;
    use crate::checkpoint::{KeyRecord, RecordKind};
    use crate::encoding::{EncodingError, decode_exact, encode_to_vec, encode_vec};

    /// # Scenario
    /// A properties block written by a newer writer that knows an extra field.
    ///
    /// # Expected behavior
    /// The known fields decode; the unknown one is skipped.
    #[test]
    fn unknown_property_is_skipped() {
        let entries = vec![
            PropertyEntry::new("compression", &String::from("none")).unwrap(),
            PropertyEntry::new(PROP_FILE_ID, &9u32).unwrap(),
            PropertyEntry::new(PROP_COUNT, &3u64).unwrap(),
            PropertyEntry::new(PROP_KEYS_HANDLE, &BlockHandle::new(0, 120)).unwrap(),
        ];
        let mut buf = Vec::new();
        encode_vec(&entries, &mut buf).unwrap();

        let props: KeyFileProperties = decode_exact(&buf).unwrap();
        assert_eq!(
            props,
            KeyFileProperties {
                file_id: 9,
                key_count: 3,
                keys_handle: BlockHandle::new(0, 120),
            }
        );
    }

    /// # Scenario
    /// A known property whose value has the wrong width.
    ///
    /// # Expected behavior
    /// Decoding fails instead of reading a neighbouring field.
    #[test]
    fn malformed_property_is_rejected() {
        let entries = vec![PropertyEntry::new(PROP_COUNT, &7u32).unwrap()];
        let mut buf = Vec::new();
        encode_vec(&entries, &mut buf).unwrap();

        let err = decode_exact::<ValueFileProperties>(&buf).unwrap_err();
        assert!(matches!(err, EncodingError::Custom(_)));
    }

    /// # Scenario
    /// Value file properties go through the codec.
    ///
    /// # Expected behavior
    /// Every field is preserved.
    #[test]
    fn value_properties_keep_every_field() {
        let props = ValueFileProperties {
            file_id: 4,
            value_count: 1_000,
            values_handle: BlockHandle::new(0, 65_536),
        };
        let bytes = encode_to_vec(&props).unwrap();
        assert_eq!(decode_exact::<ValueFileProperties>(&bytes).unwrap(), props);
    }

    /// # Scenario
    /// A tombstone record whose value handle is not empty.
    ///
    /// # Expected behavior
    /// Decoding rejects it.
    #[test]
    fn tombstone_with_value_is_rejected() {
        let mut record = KeyRecord::tombstone(b"k".to_vec(), 5);
        record.value = BlockHandle::new(0, 4);
        let bytes = encode_to_vec(&record).unwrap();

        assert!(decode_exact::<KeyRecord>(&bytes).is_err());
    }

    /// # Scenario
    /// A record kind tag outside the known range.
    ///
    /// # Expected behavior
    /// `InvalidTag`.
    #[test]
    fn unknown_record_kind_is_rejected() {
        let err = decode_exact::<RecordKind>(&[9]).unwrap_err();
        assert!(matches!(err, EncodingError::InvalidTag { tag: 9, .. }));
    }
}
