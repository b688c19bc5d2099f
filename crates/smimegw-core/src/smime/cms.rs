//! CMS enveloped-data parsing and decryption (RFC 5652)
//!
//! Key transport: RSA PKCS#1 v1.5 and RSAES-OAEP (SHA-1, SHA-256).
//! Content: AES-CBC (128/192/256) and AES-GCM (128/256, tag appended to
//! the ciphertext).

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use aes_gcm::aead::consts::{U12, U16};
use aes_gcm::aead::{Aead, AeadCore, KeyInit};
use aes_gcm::{AesGcm, Nonce};
use cms::content_info::ContentInfo;
use cms::enveloped_data::{EnvelopedData, KeyTransRecipientInfo, RecipientIdentifier, RecipientInfo};
use der::asn1::{ObjectIdentifier, OctetString};
use der::{Decode, Encode, Sequence};
use rsa::{Oaep, Pkcs1v15Encrypt, RsaPrivateKey};
use spki::AlgorithmIdentifierOwned;
use thiserror::Error;

/// id-data
pub const ID_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.1");
/// id-envelopedData
pub const ID_ENVELOPED_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.3");
/// rsaEncryption (PKCS#1 v1.5 key transport)
pub const RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
/// id-RSAES-OAEP
pub const RSAES_OAEP: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.7");
pub const ID_SHA1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.14.3.2.26");
pub const ID_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.1");
pub const AES128_CBC: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.1.2");
pub const AES192_CBC: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.1.22");
pub const AES256_CBC: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.1.42");
pub const AES128_GCM: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.1.6");
pub const AES256_GCM: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.1.46");

/// CMS errors. All of them mean the message cannot be turned into plaintext.
#[derive(Debug, Error)]
pub enum CmsError {
    #[error("malformed CMS structure: {0}")]
    Malformed(String),

    #[error("content type {0} is not enveloped-data")]
    NotEnvelopedData(ObjectIdentifier),

    #[error("no key-transport recipient info")]
    NoKeyTransportRecipient,

    #[error("unsupported key transport algorithm {0}")]
    UnsupportedKeyTransport(ObjectIdentifier),

    #[error("unsupported content encryption algorithm {0}")]
    UnsupportedContentAlgorithm(ObjectIdentifier),

    #[error("content-encryption key could not be recovered")]
    KeyUnwrap,

    #[error("content-encryption key has the wrong length for {algorithm}: {len} bytes")]
    KeyLength { algorithm: &'static str, len: usize },

    #[error("encrypted content is missing")]
    MissingContent,

    #[error("content decryption failed: {0}")]
    Content(&'static str),
}

impl From<der::Error> for CmsError {
    fn from(e: der::Error) -> Self {
        CmsError::Malformed(e.to_string())
    }
}

/// GCMParameters (RFC 5084)
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
struct GcmParameters {
    nonce: OctetString,
    icv_len: Option<u8>,
}

/// RSAES-OAEP-params (RFC 4055); MGF1 is assumed to use the same digest
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
struct RsaOaepParameters {
    #[asn1(context_specific = "0", tag_mode = "EXPLICIT", optional = "true")]
    hash: Option<AlgorithmIdentifierOwned>,
    #[asn1(context_specific = "1", tag_mode = "EXPLICIT", optional = "true")]
    mask_gen: Option<AlgorithmIdentifierOwned>,
    #[asn1(context_specific = "2", tag_mode = "EXPLICIT", optional = "true")]
    p_source: Option<AlgorithmIdentifierOwned>,
}

/// Content encryption algorithm with its parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentAlgorithm {
    AesCbc { key_len: usize, iv: Vec<u8> },
    AesGcm { key_len: usize, nonce: Vec<u8>, tag_len: usize },
}

impl ContentAlgorithm {
    fn from_identifier(alg: &AlgorithmIdentifierOwned) -> Result<Self, CmsError> {
        let params = alg
            .parameters
            .as_ref()
            .ok_or_else(|| CmsError::Malformed(format!("{} has no parameters", alg.oid)))?;
        let params = params.to_der()?;

        let cbc_key_len = match alg.oid {
            AES128_CBC => Some(16),
            AES192_CBC => Some(24),
            AES256_CBC => Some(32),
            _ => None,
        };
        if let Some(key_len) = cbc_key_len {
            let iv = OctetString::from_der(&params)?;
            if iv.as_bytes().len() != 16 {
                return Err(CmsError::Malformed(format!(
                    "CBC IV must be 16 bytes, got {}",
                    iv.as_bytes().len()
                )));
            }
            return Ok(ContentAlgorithm::AesCbc {
                key_len,
                iv: iv.as_bytes().to_vec(),
            });
        }

        let gcm_key_len = match alg.oid {
            AES128_GCM => Some(16),
            AES256_GCM => Some(32),
            _ => None,
        };
        if let Some(key_len) = gcm_key_len {
            let gcm = GcmParameters::from_der(&params)?;
            // RFC 5084 default icvLen is 12
            let tag_len = usize::from(gcm.icv_len.unwrap_or(12));
            if gcm.nonce.as_bytes().len() != 12 || !(tag_len == 12 || tag_len == 16) {
                return Err(CmsError::UnsupportedContentAlgorithm(alg.oid));
            }
            return Ok(ContentAlgorithm::AesGcm {
                key_len,
                nonce: gcm.nonce.as_bytes().to_vec(),
                tag_len,
            });
        }

        Err(CmsError::UnsupportedContentAlgorithm(alg.oid))
    }

    /// Short name for logs and metadata
    pub fn name(&self) -> &'static str {
        match self {
            ContentAlgorithm::AesCbc { key_len: 16, .. } => "aes128-cbc",
            ContentAlgorithm::AesCbc { key_len: 24, .. } => "aes192-cbc",
            ContentAlgorithm::AesCbc { .. } => "aes256-cbc",
            ContentAlgorithm::AesGcm { key_len: 16, .. } => "aes128-gcm",
            ContentAlgorithm::AesGcm { .. } => "aes256-gcm",
        }
    }

    /// Whether a modified ciphertext is detected. CBC carries no tag, so a
    /// flipped byte outside the final block still yields valid padding.
    pub fn is_authenticated(&self) -> bool {
        matches!(self, ContentAlgorithm::AesGcm { .. })
    }

    fn key_len(&self) -> usize {
        match self {
            ContentAlgorithm::AesCbc { key_len, .. } | ContentAlgorithm::AesGcm { key_len, .. } => *key_len,
        }
    }

    /// Decrypt content with an already recovered content-encryption key
    pub fn decrypt(&self, key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CmsError> {
        if key.len() != self.key_len() {
            return Err(CmsError::KeyLength {
                algorithm: self.name(),
                len: key.len(),
            });
        }

        match self {
            ContentAlgorithm::AesCbc { key_len, iv } => {
                if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
                    return Err(CmsError::Content("ciphertext is not a whole number of blocks"));
                }
                let padding_error = |_| CmsError::Content("invalid padding");
                let init_error = |_| CmsError::Content("invalid key or IV");
                match key_len {
                    16 => cbc::Decryptor::<aes::Aes128>::new_from_slices(key, iv)
                        .map_err(init_error)?
                        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                        .map_err(padding_error),
                    24 => cbc::Decryptor::<aes::Aes192>::new_from_slices(key, iv)
                        .map_err(init_error)?
                        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                        .map_err(padding_error),
                    _ => cbc::Decryptor::<aes::Aes256>::new_from_slices(key, iv)
                        .map_err(init_error)?
                        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                        .map_err(padding_error),
                }
            }
            ContentAlgorithm::AesGcm {
                key_len,
                nonce,
                tag_len,
            } => match (key_len, tag_len) {
                (16, 16) => gcm_open::<AesGcm<aes::Aes128, U12, U16>>(key, nonce, ciphertext),
                (16, _) => gcm_open::<AesGcm<aes::Aes128, U12, U12>>(key, nonce, ciphertext),
                (_, 16) => gcm_open::<AesGcm<aes::Aes256, U12, U16>>(key, nonce, ciphertext),
                _ => gcm_open::<AesGcm<aes::Aes256, U12, U12>>(key, nonce, ciphertext),
            },
        }
    }
}

fn gcm_open<C>(key: &[u8], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CmsError>
where
    C: KeyInit + Aead + AeadCore<NonceSize = U12>,
{
    let cipher = C::new_from_slice(key).map_err(|_| CmsError::Content("invalid key"))?;
    cipher
        .decrypt(Nonce::<U12>::from_slice(nonce), ciphertext)
        .map_err(|_| CmsError::Content("authentication tag mismatch"))
}

/// Key transport padding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTransport {
    RsaPkcs1v15,
    RsaOaepSha1,
    RsaOaepSha256,
}

impl KeyTransport {
    fn from_identifier(alg: &AlgorithmIdentifierOwned) -> Result<Self, CmsError> {
        match alg.oid {
            RSA_ENCRYPTION => Ok(KeyTransport::RsaPkcs1v15),
            RSAES_OAEP => {
                let hash = match &alg.parameters {
                    Some(params) => RsaOaepParameters::from_der(&params.to_der()?)?
                        .hash
                        .map(|h| h.oid),
                    None => None,
                };
                match hash {
                    None | Some(ID_SHA1) => Ok(KeyTransport::RsaOaepSha1),
                    Some(ID_SHA256) => Ok(KeyTransport::RsaOaepSha256),
                    Some(other) => Err(CmsError::UnsupportedKeyTransport(other)),
                }
            }
            other => Err(CmsError::UnsupportedKeyTransport(other)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            KeyTransport::RsaPkcs1v15 => "rsa-pkcs1v15",
            KeyTransport::RsaOaepSha1 => "rsa-oaep-sha1",
            KeyTransport::RsaOaepSha256 => "rsa-oaep-sha256",
        }
    }

    fn unwrap_key(&self, key: &RsaPrivateKey, encrypted: &[u8]) -> Result<Vec<u8>, CmsError> {
        let result = match self {
            KeyTransport::RsaPkcs1v15 => key.decrypt(Pkcs1v15Encrypt, encrypted),
            KeyTransport::RsaOaepSha1 => key.decrypt(Oaep::new::<sha1::Sha1>(), encrypted),
            KeyTransport::RsaOaepSha256 => key.decrypt(Oaep::new::<sha2::Sha256>(), encrypted),
        };
        result.map_err(|_| CmsError::KeyUnwrap)
    }
}

/// A parsed enveloped-data message
#[derive(Debug, Clone)]
pub struct EnvelopedMessage {
    data: EnvelopedData,
}

/// Successful decryption
#[derive(Debug, Clone)]
pub struct Decrypted {
    pub plaintext: Vec<u8>,
    pub content_algorithm: &'static str,
    /// The content algorithm verified an integrity tag
    pub authenticated: bool,
    pub key_transport: &'static str,
    /// Index of the recipient info that opened the message
    pub recipient_index: usize,
}

impl EnvelopedMessage {
    /// Parse a DER ContentInfo wrapping enveloped-data
    pub fn from_der(der: &[u8]) -> Result<Self, CmsError> {
        let info = ContentInfo::from_der(der)?;
        if info.content_type != ID_ENVELOPED_DATA {
            return Err(CmsError::NotEnvelopedData(info.content_type));
        }
        let data: EnvelopedData = info.content.decode_as()?;
        Ok(Self { data })
    }

    /// Whether `der` looks like a ContentInfo carrying enveloped-data
    pub fn sniff(der: &[u8]) -> bool {
        der.first() == Some(&0x30)
            && ContentInfo::from_der(der)
                .map(|info| info.content_type == ID_ENVELOPED_DATA)
                .unwrap_or(false)
    }

    /// Key-transport recipient infos with their positions
    pub fn key_transport_recipients(&self) -> impl Iterator<Item = (usize, &KeyTransRecipientInfo)> {
        self.data
            .recip_infos
            .0
            .iter()
            .enumerate()
            .filter_map(|(i, ri)| match ri {
                RecipientInfo::Ktri(ktri) => Some((i, ktri)),
                _ => None,
            })
    }

    pub fn recipient_count(&self) -> usize {
        self.data.recip_infos.0.len()
    }

    pub fn content_algorithm(&self) -> Result<ContentAlgorithm, CmsError> {
        ContentAlgorithm::from_identifier(&self.data.encrypted_content.content_enc_alg)
    }

    /// Try to open the message with one private key.
    ///
    /// `accept` selects which recipient infos this key may be tried on.
    pub fn decrypt_with<F>(&self, key: &RsaPrivateKey, accept: F) -> Result<Decrypted, CmsError>
    where
        F: Fn(&RecipientIdentifier) -> bool,
    {
        let algorithm = self.content_algorithm()?;
        let ciphertext = self
            .data
            .encrypted_content
            .encrypted_content
            .as_ref()
            .ok_or(CmsError::MissingContent)?
            .as_bytes();

        let mut last_error = CmsError::NoKeyTransportRecipient;
        let mut content_error = None;
        for (index, ktri) in self.key_transport_recipients() {
            if !accept(&ktri.rid) {
                continue;
            }

            let transport = match KeyTransport::from_identifier(&ktri.key_enc_alg) {
                Ok(t) => t,
                Err(e) => {
                    last_error = e;
                    continue;
                }
            };

            let cek = match transport.unwrap_key(key, ktri.enc_key.as_bytes()) {
                Ok(cek) => cek,
                Err(e) => {
                    last_error = e;
                    continue;
                }
            };

            // PKCS#1 v1.5 can unwrap garbage under the wrong key, so a content
            // failure only counts once no other recipient info opens the message
            let plaintext = match algorithm.decrypt(&cek, ciphertext) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    content_error = Some(e);
                    continue;
                }
            };
            return Ok(Decrypted {
                plaintext,
                content_algorithm: algorithm.name(),
                authenticated: algorithm.is_authenticated(),
                key_transport: transport.name(),
                recipient_index: index,
            });
        }

        Err(content_error.unwrap_or(last_error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::split_message;
    use crate::smime::test_support::{self, ContentCipher, Transport};
    use base64::Engine;
    use pretty_assertions::assert_eq;

    fn open(der: &[u8], key: &crate::smime::KeyMaterial) -> Result<Decrypted, CmsError> {
        EnvelopedMessage::from_der(der)?.decrypt_with(key.private_key(), |rid| key.matches(rid))
    }

    /// DER payload of an openssl-produced S/MIME message
    fn openssl_payload(eml: &[u8]) -> Vec<u8> {
        let (_, body) = split_message(eml).unwrap();
        let compact: Vec<u8> = body.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect();
        base64::engine::general_purpose::STANDARD.decode(compact).unwrap()
    }

    #[test]
    fn test_cbc_round_trip_for_all_key_sizes() {
        let alice = test_support::alice();
        for cipher in [ContentCipher::Aes128Cbc, ContentCipher::Aes192Cbc, ContentCipher::Aes256Cbc] {
            let der = test_support::encrypt(b"hello", &[alice], cipher, Transport::Pkcs1v15);
            let decrypted = open(&der, alice).unwrap();
            assert_eq!(decrypted.plaintext, b"hello");
            assert_eq!(decrypted.key_transport, "rsa-pkcs1v15");
        }
    }

    #[test]
    fn test_gcm_and_oaep() {
        let alice = test_support::alice();
        let der = test_support::encrypt(b"attack at dawn", &[alice], ContentCipher::Aes256Gcm, Transport::OaepSha256);
        let decrypted = open(&der, alice).unwrap();
        assert_eq!(decrypted.plaintext, b"attack at dawn");
        assert_eq!(decrypted.content_algorithm, "aes256-gcm");
        assert_eq!(decrypted.key_transport, "rsa-oaep-sha256");

        let der = test_support::encrypt(b"x", &[alice], ContentCipher::Aes128Gcm, Transport::OaepSha1);
        let decrypted = open(&der, alice).unwrap();
        assert_eq!(decrypted.plaintext, b"x");
        assert_eq!(decrypted.key_transport, "rsa-oaep-sha1");
    }

    #[test]
    fn test_picks_the_recipient_info_for_the_key() {
        let alice = test_support::alice();
        let bob = test_support::bob();
        let der = test_support::encrypt(b"for both", &[alice, bob], ContentCipher::Aes128Cbc, Transport::Pkcs1v15);
        let message = EnvelopedMessage::from_der(&der).unwrap();
        assert_eq!(message.recipient_count(), 2);

        assert_eq!(open(&der, bob).unwrap().plaintext, b"for both");
        assert_eq!(open(&der, alice).unwrap().plaintext, b"for both");
    }

    #[test]
    fn test_wrong_key_fails() {
        let der = test_support::encrypt(b"secret", &[test_support::bob()], ContentCipher::Aes128Gcm, Transport::OaepSha256);
        assert!(matches!(open(&der, test_support::carol()), Err(CmsError::KeyUnwrap)));
    }

    #[test]
    fn test_certificate_restricts_recipient_infos() {
        // Bob's info carries a dummy issuer/serial that Alice's certificate does not match
        let der = test_support::encrypt(b"secret", &[test_support::bob()], ContentCipher::Aes128Cbc, Transport::Pkcs1v15);
        assert!(matches!(
            open(&der, test_support::alice()),
            Err(CmsError::NoKeyTransportRecipient)
        ));
    }

    #[test]
    fn test_gcm_detects_a_flipped_byte() {
        let alice = test_support::alice();
        let der = test_support::encrypt(b"hello", &[alice], ContentCipher::Aes128Gcm, Transport::Pkcs1v15);
        let der = test_support::flip_last_content_byte(&der);

        let err = open(&der, alice).unwrap_err();
        assert!(matches!(err, CmsError::Content(_)), "{}", err);
    }

    #[test]
    fn test_cbc_does_not_detect_a_flipped_byte() {
        let alice = test_support::alice();
        let plaintext = [b'a'; 64];
        let der = test_support::encrypt(&plaintext, &[alice], ContentCipher::Aes128Cbc, Transport::Pkcs1v15);
        // 64 bytes plus a full padding block; flip the first ciphertext byte
        let der = test_support::flip_byte_from_end(&der, 80);

        let decrypted = open(&der, alice).unwrap();
        assert!(!decrypted.authenticated);
        assert_ne!(decrypted.plaintext, plaintext.to_vec());
        assert_eq!(decrypted.plaintext.len(), 64);
    }

    #[test]
    fn test_only_gcm_is_authenticated() {
        let alice = test_support::alice();
        for (cipher, authenticated) in [
            (ContentCipher::Aes128Cbc, false),
            (ContentCipher::Aes256Cbc, false),
            (ContentCipher::Aes128Gcm, true),
            (ContentCipher::Aes256Gcm, true),
        ] {
            let der = test_support::encrypt(b"x", &[alice], cipher, Transport::Pkcs1v15);
            let message = EnvelopedMessage::from_der(&der).unwrap();
            assert_eq!(message.content_algorithm().unwrap().is_authenticated(), authenticated);
            assert_eq!(open(&der, alice).unwrap().authenticated, authenticated);
        }
    }

    #[test]
    fn test_truncated_cbc_content() {
        let alice = test_support::alice();
        let der = test_support::encrypt_with_content_len(b"hello", alice, 15);
        let err = open(&der, alice).unwrap_err();
        assert!(matches!(err, CmsError::Content(_)), "{}", err);
    }

    #[test]
    fn test_rejects_garbage_and_other_content_types() {
        assert!(matches!(
            EnvelopedMessage::from_der(b"not der at all"),
            Err(CmsError::Malformed(_))
        ));
        assert!(!EnvelopedMessage::sniff(b"hello"));

        let signed = test_support::content_info(ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.2"), &[0x30, 0x00]);
        assert!(matches!(
            EnvelopedMessage::from_der(&signed),
            Err(CmsError::NotEnvelopedData(_))
        ));
        assert!(!EnvelopedMessage::sniff(&signed));
    }

    #[test]
    fn test_unsupported_content_algorithm() {
        let des_ede3_cbc = ObjectIdentifier::new_unwrap("1.2.840.113549.3.7");
        let alice = test_support::alice();
        let der = test_support::encrypt_with_algorithm(b"hello", alice, des_ede3_cbc, &[0u8; 8]);
        let err = open(&der, alice).unwrap_err();
        assert!(matches!(err, CmsError::UnsupportedContentAlgorithm(oid) if oid == des_ede3_cbc));
    }

    #[test]
    fn test_openssl_messages() {
        let alice = test_support::alice();

        let der = openssl_payload(test_support::OPENSSL_AES128_EML);
        assert!(EnvelopedMessage::sniff(&der));
        let decrypted = open(&der, alice).unwrap();
        assert_eq!(decrypted.content_algorithm, "aes128-cbc");
        assert_eq!(decrypted.plaintext, b"Content-Type: text/plain; charset=utf-8\r\n\r\nhello from openssl\r\n");

        let der = openssl_payload(test_support::OPENSSL_OAEP_AES256_EML);
        let decrypted = open(&der, alice).unwrap();
        assert_eq!(decrypted.key_transport, "rsa-oaep-sha256");
        assert_eq!(decrypted.content_algorithm, "aes256-cbc");
        assert_eq!(decrypted.plaintext, b"Content-Type: text/plain\r\n\r\nsealed with oaep\r\n");
    }
}
