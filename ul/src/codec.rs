//! Codec selection module.
//!
//! Transfer syntaxes with encapsulated pixel data
//! need a codec to compress or decompress imaging data.
//! Codec implementations live outside of this crate:
//! they are plugged in through the [`CodecFactory`] trait
//! and gathered in a [`CodecRegistry`].
//!
//! The registry is assembled once with a [`CodecRegistryBuilder`],
//! then shared by all associations as a read-only snapshot.
//! After negotiation,
//! each accepted presentation context is bound to the codec
//! of its transfer syntax, if there is one,
//! in a [`CodecSelection`].
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use snafu::Snafu;
use tracing::{debug, warn};

use crate::uids::{trim_uid, NATIVE_TRANSFER_SYNTAXES};

/// The possible error conditions when encoding or decoding pixel data.
///
/// Implementers of codecs
/// are recommended to choose the most fitting error variant
/// for the tested condition.
/// When no suitable variant is available,
/// the [`Custom`](CodecError::Custom) variant may be used.
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub), module)]
pub enum CodecError {
    /// A custom error occurred in the codec,
    /// reported as a dynamic error value with a message.
    ///
    /// The [`whatever!`](snafu::whatever) macro can be used
    /// to easily create an error of this kind.
    #[snafu(whatever, display("{}", message))]
    Custom {
        /// The error message.
        message: String,
        /// The underlying error cause, if any.
        #[snafu(source(from(Box<dyn std::error::Error + Send + Sync + 'static>, Some)))]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },

    /// The input pixel data is not encapsulated.
    NotEncapsulated,

    /// The requested frame is outside the frame range of the image.
    FrameRangeOutOfBounds,

    /// A required attribute is missing
    /// from the metadata describing the image.
    #[snafu(display("Missing required attribute `{}`", name))]
    MissingAttribute { name: &'static str },
}

/// Image attributes a codec needs to process pixel data,
/// obtained from the data set by the caller.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DatasetMetadata {
    pub rows: Option<u16>,
    pub columns: Option<u16>,
    pub samples_per_pixel: Option<u16>,
    pub bits_allocated: Option<u16>,
    pub bits_stored: Option<u16>,
    pub pixel_representation: Option<u16>,
    pub number_of_frames: Option<u32>,
    pub photometric_interpretation: Option<String>,
}

/// Options passed to a codec on each operation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CodecParameters {
    /// convert palette color images to RGB when decoding
    pub convert_palette_to_rgb: bool,
    /// codec-specific options, such as a compression quality
    pub options: BTreeMap<String, String>,
}

impl CodecParameters {
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }
}

/// A pixel data codec bound to one transfer syntax.
///
/// Pixel data travels as opaque byte buffers:
/// native (uncompressed) frames on one side,
/// encapsulated fragments on the other.
pub trait Codec: Send {
    /// Compress native pixel data.
    fn encode(
        &self,
        native: &[u8],
        metadata: &DatasetMetadata,
        parameters: &CodecParameters,
    ) -> Result<Vec<u8>, CodecError>;

    /// Decompress encapsulated pixel data into native pixel data.
    fn decode(
        &self,
        encapsulated: &[u8],
        metadata: &DatasetMetadata,
        parameters: &CodecParameters,
    ) -> Result<Vec<u8>, CodecError>;

    /// Decompress a single frame.
    ///
    /// The default implementation only supports single frame images.
    fn decode_frame(
        &self,
        frame: u32,
        encapsulated: &[u8],
        metadata: &DatasetMetadata,
        parameters: &CodecParameters,
    ) -> Result<Vec<u8>, CodecError> {
        if frame > 0 || metadata.number_of_frames.unwrap_or(1) > 1 {
            return codec_error::FrameRangeOutOfBoundsSnafu.fail();
        }
        self.decode(encapsulated, metadata, parameters)
    }
}

/// A factory of codecs for one transfer syntax.
pub trait CodecFactory: Send + Sync {
    /// A human readable name for the codec.
    fn name(&self) -> &str;

    /// The UID of the transfer syntax this factory serves.
    fn transfer_syntax(&self) -> &str;

    /// Create a new codec instance.
    fn codec(&self) -> Box<dyn Codec>;

    /// The parameters to use for an image with the given attributes.
    fn default_parameters(&self, _metadata: &DatasetMetadata) -> CodecParameters {
        CodecParameters::default()
    }
}

impl fmt::Debug for dyn CodecFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecFactory")
            .field("name", &self.name())
            .field("transfer_syntax", &self.transfer_syntax())
            .finish()
    }
}

/// An immutable set of codec factories, keyed by transfer syntax UID.
///
/// Cloning the registry is cheap,
/// and all clones share the same entries.
#[derive(Clone, Default)]
pub struct CodecRegistry {
    m: Arc<HashMap<String, Arc<dyn CodecFactory>>>,
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries: BTreeMap<&str, &str> = self
            .m
            .iter()
            .map(|(uid, factory)| (uid.as_str(), factory.name()))
            .collect();
        f.debug_struct("CodecRegistry")
            .field("m", &entries)
            .finish()
    }
}

impl CodecRegistry {
    /// Start building a new registry.
    pub fn builder() -> CodecRegistryBuilder {
        CodecRegistryBuilder::default()
    }

    /// Obtain the codec factory for the given transfer syntax UID.
    ///
    /// Returns `None` if no codec was registered for it,
    /// which is the case of the native transfer syntaxes.
    pub fn lookup(&self, transfer_syntax: &str) -> Option<Arc<dyn CodecFactory>> {
        self.m.get(trim_uid(transfer_syntax)).cloned()
    }

    /// The transfer syntaxes with a registered codec, in lexicographic order.
    pub fn supported_transfer_syntaxes(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.m.keys().map(String::as_str).collect();
        out.sort_unstable();
        out
    }

    pub fn len(&self) -> usize {
        self.m.len()
    }

    pub fn is_empty(&self) -> bool {
        self.m.is_empty()
    }

    /// Bind each accepted presentation context to
    /// the codec of its transfer syntax.
    pub fn select<'a, I>(&self, accepted: I) -> CodecSelection
    where
        I: IntoIterator<Item = (u8, &'a str)>,
    {
        let mut m = BTreeMap::new();
        for (id, transfer_syntax) in accepted {
            let factory = self.lookup(transfer_syntax);
            match &factory {
                Some(factory) => debug!(
                    "Presentation context {} uses codec {}",
                    id,
                    factory.name()
                ),
                None if !NATIVE_TRANSFER_SYNTAXES.contains(&trim_uid(transfer_syntax)) => debug!(
                    "No codec registered for transfer syntax {} (presentation context {})",
                    transfer_syntax, id
                ),
                None => {}
            }
            m.insert(
                id,
                SelectedCodec {
                    transfer_syntax: transfer_syntax.to_string(),
                    factory,
                },
            );
        }
        CodecSelection { m }
    }
}

/// Builder for a [`CodecRegistry`].
#[derive(Default)]
pub struct CodecRegistryBuilder {
    m: HashMap<String, Arc<dyn CodecFactory>>,
}

impl CodecRegistryBuilder {
    /// Register a codec factory under its transfer syntax.
    ///
    /// A factory registered later for the same transfer syntax
    /// replaces the previous one.
    pub fn register<F>(mut self, factory: F) -> Self
    where
        F: CodecFactory + 'static,
    {
        let uid = trim_uid(factory.transfer_syntax()).to_string();
        if let Some(previous) = self.m.insert(uid.clone(), Arc::new(factory)) {
            warn!(
                "Codec {} for transfer syntax {} was replaced",
                previous.name(),
                uid
            );
        }
        self
    }

    pub fn build(self) -> CodecRegistry {
        CodecRegistry { m: Arc::new(self.m) }
    }
}

/// The codec bound to an accepted presentation context.
#[derive(Clone)]
pub struct SelectedCodec {
    pub transfer_syntax: String,
    /// `None` when the transfer syntax needs no codec
    /// or none was registered
    pub factory: Option<Arc<dyn CodecFactory>>,
}

impl fmt::Debug for SelectedCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectedCodec")
            .field("transfer_syntax", &self.transfer_syntax)
            .field("codec", &self.factory.as_ref().map(|factory| factory.name()))
            .finish()
    }
}

/// The codecs chosen for the presentation contexts of an association,
/// keyed by presentation context ID.
#[derive(Debug, Clone, Default)]
pub struct CodecSelection {
    m: BTreeMap<u8, SelectedCodec>,
}

impl CodecSelection {
    /// The selection for the given presentation context,
    /// `None` if it was not accepted.
    pub fn get(&self, presentation_context_id: u8) -> Option<&SelectedCodec> {
        self.m.get(&presentation_context_id)
    }

    /// The codec factory for the given presentation context, if any.
    pub fn factory(&self, presentation_context_id: u8) -> Option<&Arc<dyn CodecFactory>> {
        self.m
            .get(&presentation_context_id)
            .and_then(|s| s.factory.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &SelectedCodec)> + '_ {
        self.m.iter().map(|(id, s)| (*id, s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uids::{EXPLICIT_VR_LITTLE_ENDIAN, RLE_LOSSLESS};
    use matches::assert_matches;

    struct Passthrough;

    impl Codec for Passthrough {
        fn encode(
            &self,
            native: &[u8],
            _metadata: &DatasetMetadata,
            _parameters: &CodecParameters,
        ) -> Result<Vec<u8>, CodecError> {
            Ok(native.to_vec())
        }

        fn decode(
            &self,
            encapsulated: &[u8],
            _metadata: &DatasetMetadata,
            _parameters: &CodecParameters,
        ) -> Result<Vec<u8>, CodecError> {
            Ok(encapsulated.to_vec())
        }
    }

    struct DummyRle(&'static str);

    impl CodecFactory for DummyRle {
        fn name(&self) -> &str {
            self.0
        }

        fn transfer_syntax(&self) -> &str {
            RLE_LOSSLESS
        }

        fn codec(&self) -> Box<dyn Codec> {
            Box::new(Passthrough)
        }

        fn default_parameters(&self, metadata: &DatasetMetadata) -> CodecParameters {
            CodecParameters {
                convert_palette_to_rgb: metadata.photometric_interpretation.as_deref()
                    == Some("PALETTE COLOR"),
                ..Default::default()
            }
            .with_option("segments", "auto")
        }
    }

    #[test]
    fn lookup_registered_and_unregistered() {
        let registry = CodecRegistry::builder().register(DummyRle("rle")).build();

        let factory = registry.lookup(RLE_LOSSLESS).unwrap();
        assert_eq!(factory.name(), "rle");
        // padded UIDs are accepted
        assert!(registry.lookup("1.2.840.10008.1.2.5\0").is_some());
        assert!(registry.lookup(EXPLICIT_VR_LITTLE_ENDIAN).is_none());
        assert_eq!(registry.supported_transfer_syntaxes(), vec![RLE_LOSSLESS]);
    }

    #[test]
    fn later_registration_wins() {
        let registry = CodecRegistry::builder()
            .register(DummyRle("first"))
            .register(DummyRle("second"))
            .build();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup(RLE_LOSSLESS).unwrap().name(), "second");
    }

    #[test]
    fn select_per_context() {
        let registry = CodecRegistry::builder().register(DummyRle("rle")).build();
        let selection = registry.select([(1, EXPLICIT_VR_LITTLE_ENDIAN), (3, RLE_LOSSLESS)]);

        assert!(selection.factory(1).is_none());
        assert_eq!(
            selection.get(1).map(|s| s.transfer_syntax.as_str()),
            Some(EXPLICIT_VR_LITTLE_ENDIAN)
        );
        assert_eq!(selection.factory(3).map(|f| f.name()), Some("rle"));
        assert!(selection.get(5).is_none());
    }

    #[test]
    fn default_parameters_and_frames() {
        let factory = DummyRle("rle");
        let metadata = DatasetMetadata {
            photometric_interpretation: Some("PALETTE COLOR".to_string()),
            number_of_frames: Some(2),
            ..Default::default()
        };
        let parameters = factory.default_parameters(&metadata);
        assert!(parameters.convert_palette_to_rgb);
        assert_eq!(parameters.option("segments"), Some("auto"));

        let codec = factory.codec();
        assert_matches!(
            codec.decode_frame(0, &[1, 2], &metadata, &parameters),
            Err(CodecError::FrameRangeOutOfBounds { .. })
        );
        let single = DatasetMetadata::default();
        assert_eq!(
            codec.decode_frame(0, &[1, 2], &single, &parameters).unwrap(),
            vec![1, 2]
        );
    }
}
