//! Fixture keys and a minimal CMS enveloped-data encoder for tests

use super::cms::{
    AES128_CBC, AES128_GCM, AES192_CBC, AES256_CBC, AES256_GCM, ID_DATA, ID_ENVELOPED_DATA, ID_SHA256,
    RSAES_OAEP, RSA_ENCRYPTION,
};
use super::keystore::KeyMaterial;
use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
use aes_gcm::aead::{Aead, KeyInit};
use base64::Engine;
use chrono::{TimeZone, Utc};
use der::asn1::ObjectIdentifier;
use der::Encode;
use rand::RngCore;
use rsa::{Oaep, Pkcs1v15Encrypt, RsaPublicKey};
use std::path::Path;
use std::sync::OnceLock;

pub const ALICE_PEM: &[u8] = include_bytes!("../../testdata/alice.pem");
pub const ALICE_CERT_ONLY_PEM: &[u8] = include_bytes!("../../testdata/alice.crt");
pub const BOB_PEM: &[u8] = include_bytes!("../../testdata/bob.pem");
pub const CAROL_DER: &[u8] = include_bytes!("../../testdata/carol.der");
pub const OPENSSL_AES128_EML: &[u8] = include_bytes!("../../testdata/openssl-aes128.eml");
pub const OPENSSL_OAEP_AES256_EML: &[u8] = include_bytes!("../../testdata/openssl-oaep-aes256.eml");

const ID_MGF1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.8");

/// PKCS#8 key with certificate
pub fn alice() -> &'static KeyMaterial {
    static KEY: OnceLock<KeyMaterial> = OnceLock::new();
    KEY.get_or_init(|| load_pem(ALICE_PEM, "alice.pem"))
}

/// PKCS#1 key, no certificate
pub fn bob() -> &'static KeyMaterial {
    static KEY: OnceLock<KeyMaterial> = OnceLock::new();
    KEY.get_or_init(|| load_pem(BOB_PEM, "bob.pem"))
}

/// DER PKCS#8 key, no certificate
pub fn carol() -> &'static KeyMaterial {
    static KEY: OnceLock<KeyMaterial> = OnceLock::new();
    KEY.get_or_init(|| KeyMaterial::from_der(CAROL_DER, Path::new("carol.der"), fixed_time()).unwrap())
}

fn load_pem(data: &[u8], name: &str) -> KeyMaterial {
    KeyMaterial::from_pem(data, Path::new(name), fixed_time()).unwrap()
}

fn fixed_time() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

#[derive(Debug, Clone, Copy)]
pub enum ContentCipher {
    Aes128Cbc,
    Aes192Cbc,
    Aes256Cbc,
    Aes128Gcm,
    Aes256Gcm,
}

#[derive(Debug, Clone, Copy)]
pub enum Transport {
    Pkcs1v15,
    OaepSha1,
    OaepSha256,
}

fn tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes: Vec<u8> = len.to_be_bytes().into_iter().skip_while(|b| *b == 0).collect();
        out.push(0x80 | bytes.len() as u8);
        out.extend(bytes);
    }
    out.extend_from_slice(content);
    out
}

fn seq(parts: &[Vec<u8>]) -> Vec<u8> {
    tlv(0x30, &parts.concat())
}

fn set_of(mut parts: Vec<Vec<u8>>) -> Vec<u8> {
    parts.sort();
    tlv(0x31, &parts.concat())
}

fn oid(oid: ObjectIdentifier) -> Vec<u8> {
    tlv(0x06, oid.as_bytes())
}

fn octets(bytes: &[u8]) -> Vec<u8> {
    tlv(0x04, bytes)
}

fn small_int(n: u8) -> Vec<u8> {
    tlv(0x02, &[n])
}

fn explicit(n: u8, inner: &[u8]) -> Vec<u8> {
    tlv(0xA0 | n, inner)
}

/// Wrap `content` in a ContentInfo of type `content_type`
pub fn content_info(content_type: ObjectIdentifier, content: &[u8]) -> Vec<u8> {
    seq(&[oid(content_type), explicit(0, content)])
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// IssuerAndSerialNumber from the key's certificate, or a dummy one
fn recipient_id(key: &KeyMaterial) -> Vec<u8> {
    match key.certificate() {
        Some(cert) => seq(&[
            cert.tbs_certificate.issuer.to_der().unwrap(),
            cert.tbs_certificate.serial_number.to_der().unwrap(),
        ]),
        None => seq(&[seq(&[]), small_int(1)]),
    }
}

fn key_transport(key: &KeyMaterial, transport: Transport, cek: &[u8]) -> Vec<u8> {
    let public = RsaPublicKey::from(key.private_key());
    let mut rng = rand::thread_rng();
    let (algorithm, encrypted) = match transport {
        Transport::Pkcs1v15 => (
            seq(&[oid(RSA_ENCRYPTION), vec![0x05, 0x00]]),
            public.encrypt(&mut rng, Pkcs1v15Encrypt, cek).unwrap(),
        ),
        Transport::OaepSha1 => (
            seq(&[oid(RSAES_OAEP), seq(&[])]),
            public.encrypt(&mut rng, Oaep::new::<sha1::Sha1>(), cek).unwrap(),
        ),
        Transport::OaepSha256 => {
            let sha256 = seq(&[oid(ID_SHA256)]);
            let params = seq(&[
                explicit(0, &sha256),
                explicit(1, &seq(&[oid(ID_MGF1), sha256.clone()])),
            ]);
            (
                seq(&[oid(RSAES_OAEP), params]),
                public.encrypt(&mut rng, Oaep::new::<sha2::Sha256>(), cek).unwrap(),
            )
        }
    };

    seq(&[small_int(0), recipient_id(key), algorithm, octets(&encrypted)])
}

fn enveloped(recipients: Vec<Vec<u8>>, content_algorithm: Vec<u8>, ciphertext: &[u8]) -> Vec<u8> {
    let encrypted_content_info = seq(&[oid(ID_DATA), content_algorithm, tlv(0x80, ciphertext)]);
    let enveloped_data = seq(&[small_int(0), set_of(recipients), encrypted_content_info]);
    content_info(ID_ENVELOPED_DATA, &enveloped_data)
}

fn cbc_encrypt(cek: &[u8], iv: &[u8], plaintext: &[u8]) -> Vec<u8> {
    match cek.len() {
        16 => cbc::Encryptor::<aes::Aes128>::new_from_slices(cek, iv)
            .unwrap()
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        24 => cbc::Encryptor::<aes::Aes192>::new_from_slices(cek, iv)
            .unwrap()
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        _ => cbc::Encryptor::<aes::Aes256>::new_from_slices(cek, iv)
            .unwrap()
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
    }
}

fn seal(plaintext: &[u8], cipher: ContentCipher) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
    match cipher {
        ContentCipher::Aes128Cbc | ContentCipher::Aes192Cbc | ContentCipher::Aes256Cbc => {
            let (len, alg) = match cipher {
                ContentCipher::Aes128Cbc => (16, AES128_CBC),
                ContentCipher::Aes192Cbc => (24, AES192_CBC),
                _ => (32, AES256_CBC),
            };
            let cek = random_bytes(len);
            let iv = random_bytes(16);
            let ciphertext = cbc_encrypt(&cek, &iv, plaintext);
            (cek, seq(&[oid(alg), octets(&iv)]), ciphertext)
        }
        ContentCipher::Aes128Gcm | ContentCipher::Aes256Gcm => {
            let nonce = random_bytes(12);
            let (cek, alg, ciphertext) = match cipher {
                ContentCipher::Aes128Gcm => {
                    let cek = random_bytes(16);
                    let ct = aes_gcm::Aes128Gcm::new_from_slice(&cek)
                        .unwrap()
                        .encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext)
                        .unwrap();
                    (cek, AES128_GCM, ct)
                }
                _ => {
                    let cek = random_bytes(32);
                    let ct = aes_gcm::Aes256Gcm::new_from_slice(&cek)
                        .unwrap()
                        .encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext)
                        .unwrap();
                    (cek, AES256_GCM, ct)
                }
            };
            (cek, seq(&[oid(alg), seq(&[octets(&nonce), small_int(16)])]), ciphertext)
        }
    }
}

/// Encrypt `plaintext` to every key in `recipients`
pub fn encrypt(plaintext: &[u8], recipients: &[&KeyMaterial], cipher: ContentCipher, transport: Transport) -> Vec<u8> {
    let (cek, algorithm, ciphertext) = seal(plaintext, cipher);
    let infos = recipients
        .iter()
        .map(|key| key_transport(key, transport, &cek))
        .collect();
    enveloped(infos, algorithm, &ciphertext)
}

/// AES-128-CBC message whose ciphertext is cut to `len` bytes
pub fn encrypt_with_content_len(plaintext: &[u8], recipient: &KeyMaterial, len: usize) -> Vec<u8> {
    let (cek, algorithm, mut ciphertext) = seal(plaintext, ContentCipher::Aes128Cbc);
    ciphertext.truncate(len);
    enveloped(vec![key_transport(recipient, Transport::Pkcs1v15, &cek)], algorithm, &ciphertext)
}

/// Message claiming content algorithm `algorithm` with an IV parameter
pub fn encrypt_with_algorithm(
    plaintext: &[u8],
    recipient: &KeyMaterial,
    algorithm: ObjectIdentifier,
    iv: &[u8],
) -> Vec<u8> {
    let cek = random_bytes(24);
    enveloped(
        vec![key_transport(recipient, Transport::Pkcs1v15, &cek)],
        seq(&[oid(algorithm), octets(iv)]),
        plaintext,
    )
}

/// Flip the final byte, which is the last byte of the encrypted content
pub fn flip_last_content_byte(der: &[u8]) -> Vec<u8> {
    flip_byte_from_end(der, 1)
}

/// Flip the byte `back` positions from the end. The encrypted content is
/// the last field, so `back` up to its length lands inside the ciphertext.
pub fn flip_byte_from_end(der: &[u8], back: usize) -> Vec<u8> {
    let mut der = der.to_vec();
    let index = der.len() - back;
    der[index] ^= 0x01;
    der
}

/// RFC 5322 message carrying `der` as base64 S/MIME
pub fn smime_message(to: &str, der: &[u8]) -> Vec<u8> {
    let encoded = base64::engine::general_purpose::STANDARD.encode(der);
    let mut message = format!(
        "From: bob@example.com\r\nTo: {}\r\nSubject: Encrypted\r\nMIME-Version: 1.0\r\n\
         Content-Type: application/pkcs7-mime; smime-type=enveloped-data; name=\"smime.p7m\"\r\n\
         Content-Transfer-Encoding: base64\r\n\
         Content-Disposition: attachment; filename=\"smime.p7m\"\r\n\r\n",
        to
    );
    for chunk in encoded.as_bytes().chunks(76) {
        message.push_str(std::str::from_utf8(chunk).unwrap());
        message.push_str("\r\n");
    }
    message.into_bytes()
}
