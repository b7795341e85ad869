use std::collections::BTreeMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;

use shroud_crypto::kdf::KdfParams;
use shroud_crypto::Algorithm;
use shroud_types::{Result, ShroudError};

use crate::kms::KeyEnvelope;
use crate::manifest::ChunkManifest;

/// Namespace for crypto metadata attached to stored objects.
pub const META_PREFIX: &str = "x-amz-meta-encryption-";
/// Short namespace used when the encoded metadata exceeds the provider
/// budget under the long names.
pub const META_PREFIX_SHORT: &str = "x-amz-meta-enc-";
/// Reserved for a pre-encryption transform; the codec passes this
/// namespace through untouched.
pub const META_COMPRESSION_PREFIX: &str = "x-amz-meta-compression-";

/// Default per-provider metadata budget in bytes.
pub const DEFAULT_METADATA_BUDGET: usize = 8 * 1024;

/// Field names within the namespace, paired with the fixed short form.
const FIELDS: &[(&str, &str)] = &[
    ("encrypted", "e"),
    ("algorithm", "a"),
    ("chunked", "c"),
    ("chunk-size", "cs"),
    ("chunk-count", "cc"),
    ("manifest", "mf"),
    ("wrapped-key-ciphertext", "wk"),
    ("key-version", "kv"),
    ("key-id", "ki"),
    ("kms-provider", "kp"),
    ("salt", "s"),
    ("kdf-params", "kd"),
    ("original-content-length", "ol"),
    ("original-etag", "oe"),
    ("original-content-type", "oc"),
];

fn long_name(field: &str) -> String {
    format!("{META_PREFIX}{field}")
}

fn short_name(field: &str) -> String {
    let short = FIELDS
        .iter()
        .find(|(long, _)| *long == field)
        .map(|(_, s)| *s)
        .unwrap_or(field);
    format!("{META_PREFIX_SHORT}{short}")
}

/// base64url (no padding) serde adapter for fixed-size byte fields.
pub mod base64url_bytes {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> std::result::Result<[u8; N], D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let decoded = URL_SAFE_NO_PAD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)?;
        decoded
            .try_into()
            .map_err(|v: Vec<u8>| serde::de::Error::custom(format!("expected {N} bytes, got {}", v.len())))
    }
}

/// How the object's AEAD key is provisioned: a KMS-wrapped envelope, or a
/// key derived from the configured password. Exactly one applies per
/// object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    Envelope(KeyEnvelope),
    PasswordDerived { salt: Vec<u8>, kdf: KdfParams },
}

/// Logical crypto metadata for one stored object. Encoded into bounded
/// header key/value pairs on PUT and decoded back on GET/HEAD.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectCryptoMetadata {
    pub algorithm: Algorithm,
    pub manifest: ChunkManifest,
    pub key_source: KeySource,
    pub original_content_length: Option<u64>,
    pub original_etag: Option<String>,
    pub original_content_type: Option<String>,
}

impl ObjectCryptoMetadata {
    /// Encode into header pairs, staying within `budget` bytes (keys plus
    /// values). Long names are preferred; the fixed short-name map is the
    /// fallback before giving up with `MetadataTooLarge`.
    pub fn encode(&self, budget: usize) -> Result<BTreeMap<String, String>> {
        let long = self.encode_with(long_name)?;
        if encoded_size(&long) <= budget {
            return Ok(long);
        }
        let short = self.encode_with(short_name)?;
        let size = encoded_size(&short);
        if size <= budget {
            return Ok(short);
        }
        Err(ShroudError::MetadataTooLarge { size, budget })
    }

    fn encode_with(&self, name: impl Fn(&str) -> String) -> Result<BTreeMap<String, String>> {
        let mut map = BTreeMap::new();
        let mut put = |field: &str, value: String| {
            map.insert(name(field), value);
        };

        put("encrypted", "true".into());
        put("algorithm", self.algorithm.wire_name().into());
        put("chunked", "true".into());
        put("chunk-size", self.manifest.chunk_size.to_string());
        put("chunk-count", self.manifest.chunk_count.to_string());

        let manifest_json = serde_json::to_vec(&self.manifest)
            .map_err(|e| ShroudError::MetadataMalformed(format!("manifest encode: {e}")))?;
        put("manifest", URL_SAFE_NO_PAD.encode(manifest_json));

        match &self.key_source {
            KeySource::Envelope(envelope) => {
                put(
                    "wrapped-key-ciphertext",
                    URL_SAFE_NO_PAD.encode(&envelope.ciphertext),
                );
                put("key-version", envelope.key_version.to_string());
                put("key-id", envelope.key_id.clone());
                put("kms-provider", envelope.provider.clone());
            }
            KeySource::PasswordDerived { salt, kdf } => {
                put("salt", URL_SAFE_NO_PAD.encode(salt));
                let kdf_json = serde_json::to_vec(kdf)
                    .map_err(|e| ShroudError::MetadataMalformed(format!("kdf encode: {e}")))?;
                put("kdf-params", URL_SAFE_NO_PAD.encode(kdf_json));
            }
        }

        if let Some(len) = self.original_content_length {
            put("original-content-length", len.to_string());
        }
        if let Some(etag) = &self.original_etag {
            put("original-etag", etag.clone());
        }
        if let Some(content_type) = &self.original_content_type {
            put("original-content-type", content_type.clone());
        }
        Ok(map)
    }

    /// Decode from a stored object's metadata map. Accepts either the
    /// long or the short name set.
    pub fn decode(metadata: &BTreeMap<String, String>) -> Result<Self> {
        let field = |name| field(metadata, name);
        let required = |name| required(metadata, name);

        if required("encrypted")? != "true" {
            return Err(ShroudError::MetadataMalformed(
                "object is not marked encrypted".into(),
            ));
        }
        if required("chunked")? != "true" {
            return Err(ShroudError::MetadataMalformed(
                "object does not use the chunked layout".into(),
            ));
        }

        let algorithm = Algorithm::from_wire_name(required("algorithm")?)?;

        let manifest_bytes = URL_SAFE_NO_PAD
            .decode(required("manifest")?.as_bytes())
            .map_err(|e| ShroudError::MetadataMalformed(format!("manifest base64: {e}")))?;
        let manifest: ChunkManifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| ShroudError::MetadataMalformed(format!("manifest json: {e}")))?;
        manifest.validate()?;

        // Cross-check the standalone fields against the manifest; drift
        // means the metadata was hand-edited or corrupted.
        let chunk_size: u32 = parse_number(required("chunk-size")?, "chunk-size")?;
        let chunk_count: u64 = parse_number(required("chunk-count")?, "chunk-count")?;
        if chunk_size != manifest.chunk_size || chunk_count != manifest.chunk_count {
            return Err(ShroudError::MetadataMalformed(
                "chunk fields disagree with the manifest".into(),
            ));
        }

        let has_envelope = field("wrapped-key-ciphertext").is_some();
        let has_salt = field("salt").is_some();
        let key_source = match (has_envelope, has_salt) {
            (true, false) => KeySource::Envelope(KeyEnvelope {
                key_id: required("key-id")?.clone(),
                key_version: parse_number(required("key-version")?, "key-version")?,
                provider: field("kms-provider").cloned().unwrap_or_default(),
                ciphertext: URL_SAFE_NO_PAD
                    .decode(required("wrapped-key-ciphertext")?.as_bytes())
                    .map_err(|e| {
                        ShroudError::MetadataMalformed(format!("wrapped key base64: {e}"))
                    })?,
            }),
            (false, true) => {
                let salt = URL_SAFE_NO_PAD
                    .decode(required("salt")?.as_bytes())
                    .map_err(|e| ShroudError::MetadataMalformed(format!("salt base64: {e}")))?;
                let kdf_bytes = URL_SAFE_NO_PAD
                    .decode(required("kdf-params")?.as_bytes())
                    .map_err(|e| ShroudError::MetadataMalformed(format!("kdf base64: {e}")))?;
                let kdf: KdfParams = serde_json::from_slice(&kdf_bytes)
                    .map_err(|e| ShroudError::MetadataMalformed(format!("kdf json: {e}")))?;
                kdf.validate()?;
                KeySource::PasswordDerived { salt, kdf }
            }
            (true, true) => {
                return Err(ShroudError::MetadataMalformed(
                    "object carries both a key envelope and a derivation salt".into(),
                ))
            }
            (false, false) => {
                return Err(ShroudError::MetadataMalformed(
                    "object carries neither a key envelope nor a derivation salt".into(),
                ))
            }
        };

        let original_content_length = field("original-content-length")
            .map(|v| parse_number(v, "original-content-length"))
            .transpose()?;

        Ok(Self {
            algorithm,
            manifest,
            key_source,
            original_content_length,
            original_etag: field("original-etag").cloned(),
            original_content_type: field("original-content-type").cloned(),
        })
    }
}

fn field<'a>(metadata: &'a BTreeMap<String, String>, name: &str) -> Option<&'a String> {
    metadata
        .get(&long_name(name))
        .or_else(|| metadata.get(&short_name(name)))
}

fn required<'a>(metadata: &'a BTreeMap<String, String>, name: &str) -> Result<&'a String> {
    field(metadata, name)
        .ok_or_else(|| ShroudError::MetadataMalformed(format!("missing field '{name}'")))
}

fn parse_number<T: std::str::FromStr>(value: &str, name: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| ShroudError::MetadataMalformed(format!("invalid {name}: '{value}'")))
}

/// Whether a metadata map marks the object as gateway-encrypted.
pub fn is_encrypted(metadata: &BTreeMap<String, String>) -> bool {
    metadata
        .get(&long_name("encrypted"))
        .or_else(|| metadata.get(&short_name("encrypted")))
        .is_some_and(|v| v == "true")
}

/// Remove all crypto-namespace keys before a response goes back to the
/// client. The reserved compression namespace and everything else pass
/// through.
pub fn strip_crypto_metadata(metadata: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    metadata
        .iter()
        .filter(|(k, _)| !k.starts_with(META_PREFIX) && !k.starts_with(META_PREFIX_SHORT))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn encoded_size(map: &BTreeMap<String, String>) -> usize {
    map.iter().map(|(k, v)| k.len() + v.len()).sum()
}
