//! Encoding, hashing and compression helpers shared by tag methods,
//! expression functions and matcher group decoding.
//!
//! Template values are strings, but several helpers produce arbitrary
//! bytes. Bytes that are not valid UTF-8 are carried as Latin-1 strings
//! (one char per byte) and turned back into the same bytes by [`to_bytes`].

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use flate2::write::{DeflateEncoder, GzEncoder, ZlibEncoder};
use flate2::Compression;
use hmac::{Hmac, Mac};
use sha2::Digest;
use std::io::{Read, Write};

/// Turn a template string back into the bytes it stands for
pub fn to_bytes(value: &str) -> Vec<u8> {
    let latin1 = value.chars().all(|c| (c as u32) <= 0xFF);
    let high = value.chars().any(|c| (0x80..=0xFF).contains(&(c as u32)));
    if latin1 && high {
        value.chars().map(|c| c as u32 as u8).collect()
    } else {
        value.as_bytes().to_vec()
    }
}

/// Carry bytes as a string: UTF-8 when valid, Latin-1 otherwise
pub fn from_bytes(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => err.into_bytes().iter().map(|b| *b as char).collect(),
    }
}

pub fn base64_encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode standard or URL-safe base64, padded or not
pub fn base64_decode(data: &str) -> Option<Vec<u8>> {
    let trimmed: String = data.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(&trimmed)
        .or_else(|_| STANDARD_NO_PAD.decode(&trimmed))
        .or_else(|_| URL_SAFE.decode(&trimmed))
        .or_else(|_| URL_SAFE_NO_PAD.decode(&trimmed))
        .ok()
}

pub fn hex_decode(data: &str) -> Option<Vec<u8>> {
    let trimmed = data.trim();
    let trimmed = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    hex::decode(trimmed).ok()
}

/// Percent-encode every byte
pub fn url_encode_all(data: &[u8]) -> String {
    data.iter().map(|b| format!("%{:02x}", b)).collect()
}

/// Query-style escaping: unreserved characters kept, space as `+`
pub fn url_escape(data: &str) -> String {
    urlencoding::encode(data).replace("%20", "+")
}

pub fn url_decode(data: &str) -> String {
    let replaced = data.replace('+', " ");
    from_bytes(urlencoding::decode_binary(replaced.as_bytes()).into_owned())
}

/// Hex digest of `data` with the named algorithm
pub fn digest_hex(algorithm: &str, data: &[u8]) -> Option<String> {
    let digest = match algorithm.to_ascii_lowercase().as_str() {
        "md5" => md5::Md5::digest(data).to_vec(),
        "sha1" => sha1::Sha1::digest(data).to_vec(),
        "sha224" => sha2::Sha224::digest(data).to_vec(),
        "sha256" => sha2::Sha256::digest(data).to_vec(),
        "sha384" => sha2::Sha384::digest(data).to_vec(),
        "sha512" => sha2::Sha512::digest(data).to_vec(),
        "sm3" => sm3::Sm3::digest(data).to_vec(),
        _ => return None,
    };
    Some(hex::encode(digest))
}

/// Hex HMAC of `data` keyed with `secret`
pub fn hmac_hex(algorithm: &str, data: &[u8], secret: &[u8]) -> Option<String> {
    fn run<M: Mac + hmac::digest::KeyInit>(data: &[u8], secret: &[u8]) -> Option<String> {
        let mut mac = <M as hmac::digest::KeyInit>::new_from_slice(secret).ok()?;
        mac.update(data);
        Some(hex::encode(mac.finalize().into_bytes()))
    }
    match algorithm.to_ascii_lowercase().as_str() {
        "md5" => run::<Hmac<md5::Md5>>(data, secret),
        "sha1" => run::<Hmac<sha1::Sha1>>(data, secret),
        "sha256" => run::<Hmac<sha2::Sha256>>(data, secret),
        "sha512" => run::<Hmac<sha2::Sha512>>(data, secret),
        _ => None,
    }
}

/// Signed 32-bit murmur3 hash, as favicon fingerprints are usually written
pub fn mmh3(data: &[u8]) -> Option<i64> {
    let hash = murmur3::murmur3_32(&mut std::io::Cursor::new(data), 0).ok()?;
    Some(hash as i32 as i64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compressor {
    Gzip,
    Zlib,
    Deflate,
}

pub fn compress(kind: Compressor, data: &[u8]) -> std::io::Result<Vec<u8>> {
    match kind {
        Compressor::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
        Compressor::Zlib => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
        Compressor::Deflate => {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            encoder.finish()
        }
    }
}

pub fn decompress(kind: Compressor, data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    match kind {
        Compressor::Gzip => GzDecoder::new(data).read_to_end(&mut out)?,
        Compressor::Zlib => ZlibDecoder::new(data).read_to_end(&mut out)?,
        Compressor::Deflate => DeflateDecoder::new(data).read_to_end(&mut out)?,
    };
    Ok(out)
}

/// AES-CBC with PKCS#7 padding; key length selects AES-128/192/256
pub fn aes_cbc_encrypt(key: &[u8], iv: &[u8], data: &[u8]) -> Option<Vec<u8>> {
    use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
    match key.len() {
        16 => cbc::Encryptor::<aes::Aes128>::new_from_slices(key, iv)
            .ok()
            .map(|c| c.encrypt_padded_vec_mut::<Pkcs7>(data)),
        24 => cbc::Encryptor::<aes::Aes192>::new_from_slices(key, iv)
            .ok()
            .map(|c| c.encrypt_padded_vec_mut::<Pkcs7>(data)),
        32 => cbc::Encryptor::<aes::Aes256>::new_from_slices(key, iv)
            .ok()
            .map(|c| c.encrypt_padded_vec_mut::<Pkcs7>(data)),
        _ => None,
    }
}

pub fn html_escape(data: &str) -> String {
    html_escape::encode_safe(data).into_owned()
}

pub fn html_unescape(data: &str) -> String {
    html_escape::decode_html_entities(data).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_strings_survive() {
        let raw = vec![0x1f, 0x8b, 0x08, 0xff, b'a'];
        let carried = from_bytes(raw.clone());
        assert_eq!(to_bytes(&carried), raw);
        assert_eq!(to_bytes("plain"), b"plain".to_vec());
    }

    #[test]
    fn test_digests() {
        assert_eq!(
            digest_hex("md5", b"admin").as_deref(),
            Some("21232f297a57a5a743894a0e4a801fc3")
        );
        assert_eq!(
            digest_hex("sha1", b"abc").as_deref(),
            Some("a9993e364706816aba3e25717850c26c9cd0d89d")
        );
        assert!(digest_hex("crc", b"abc").is_none());
    }

    #[test]
    fn test_compression_round_trip() {
        for kind in [Compressor::Gzip, Compressor::Zlib, Compressor::Deflate] {
            let packed = compress(kind, b"hello hello hello").expect("compress");
            assert_eq!(decompress(kind, &packed).expect("decompress"), b"hello hello hello");
        }
    }

    #[test]
    fn test_url_helpers() {
        assert_eq!(url_escape("a b&c"), "a+b%26c");
        assert_eq!(url_decode("a+b%26c"), "a b&c");
        assert_eq!(url_encode_all(b"ab"), "%61%62");
    }

    #[test]
    fn test_base64_lenient() {
        assert_eq!(base64_decode("YWJj").as_deref(), Some(&b"abc"[..]));
        assert_eq!(base64_decode("YWI").as_deref(), Some(&b"ab"[..]));
    }

    #[test]
    fn test_aes_cbc_block_size() {
        let out = aes_cbc_encrypt(&[7u8; 16], &[0u8; 16], b"0123456789").expect("encrypt");
        assert_eq!(out.len(), 16);
        assert!(aes_cbc_encrypt(&[7u8; 10], &[0u8; 16], b"x").is_none());
    }
}
