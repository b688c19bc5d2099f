//! S/MIME support: key store, CMS enveloped-data and MIME handling

pub mod cms;
pub mod keystore;
pub mod mime;

#[cfg(test)]
pub(crate) mod test_support;

pub use self::cms::{CmsError, ContentAlgorithm, Decrypted, EnvelopedMessage, KeyTransport};
pub use keystore::{
    DirectoryKeySource, KeyLoadError, KeyMaterial, KeyRing, KeySource, KeyStore, MemoryKeySource,
};
pub use mime::{ContentType, Detection, MimeError};
