//! Well-known unique identifiers used by the protocol engine,
//! plus a helper for normalizing UIDs read from the wire.

/// DICOM Application Context Name
pub const DICOM_APPLICATION_CONTEXT: &str = "1.2.840.10008.3.1.1.1";

/// Verification SOP Class
pub const VERIFICATION: &str = "1.2.840.10008.1.1";

/// Implicit VR Little Endian: Default Transfer Syntax for DICOM
pub const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";

/// Explicit VR Little Endian
pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";

/// Explicit VR Big Endian (retired)
pub const EXPLICIT_VR_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";

/// RLE Lossless
pub const RLE_LOSSLESS: &str = "1.2.840.10008.1.2.5";

/// The transfer syntaxes which need no pixel data codec.
pub const NATIVE_TRANSFER_SYNTAXES: [&str; 3] = [
    EXPLICIT_VR_LITTLE_ENDIAN,
    IMPLICIT_VR_LITTLE_ENDIAN,
    EXPLICIT_VR_BIG_ENDIAN,
];

/// Remove the padding which may surround a UID on the wire:
/// trailing null characters and any whitespace.
pub fn trim_uid(uid: &str) -> &str {
    uid.trim_matches(|c: char| c == '\0' || c.is_whitespace())
}

#[cfg(test)]
mod tests {
    use super::trim_uid;

    #[test]
    fn trims_padding() {
        assert_eq!(trim_uid("1.2.3.4"), "1.2.3.4");
        assert_eq!(trim_uid("1.2.3.4\0"), "1.2.3.4");
        assert_eq!(trim_uid("1.2.3.45 "), "1.2.3.45");
        assert_eq!(trim_uid(" 1.2\0\0"), "1.2");
    }
}
