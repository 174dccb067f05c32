use aes_gcm::{
	aead::{Aead, KeyInit},
	Aes128Gcm, Key, Nonce,
};

/// Session `iv` is carried on the wire as 16 bytes, but AES-GCM needs a 12-byte nonce;
/// the reference protocol uses the leading 12 bytes of the rolling IV as that nonce.
pub fn gcm_nonce_from_iv(iv: &[u8; 16]) -> [u8; 12] {
	iv[..12].try_into().unwrap()
}

/// Encrypts `plaintext` with AES-128-GCM, returning the ciphertext and writing the
/// 16-byte authentication tag into `tag` separately (the reference protocol carries
/// tag and ciphertext in separate wire fields, unlike this crate's combined output).
pub fn encrypt(
	plaintext: &[u8],
	key: &[u8],
	nonce: &[u8],
	tag: &mut [u8],
) -> Result<Vec<u8>, aes_gcm::Error> {
	let key = Key::<Aes128Gcm>::from_slice(key);
	let nonce = Nonce::from_slice(nonce);
	let cipher = Aes128Gcm::new(key);

	let mut ciphertext = cipher.encrypt(nonce, plaintext)?;

	let tag_len = 16;
	if ciphertext.len() < tag_len {
		return Err(aes_gcm::Error);
	}
	let split = ciphertext.len() - tag_len;
	tag.copy_from_slice(&ciphertext[split..]);
	ciphertext.truncate(split);

	Ok(ciphertext)
}

/// Decrypts `ciphertext` with AES-128-GCM, checking it against the given tag.
pub fn decrypt(ciphertext: &[u8], key: &[u8], nonce: &[u8], tag: &[u8]) -> Result<Vec<u8>, aes_gcm::Error> {
	let key = Key::<Aes128Gcm>::from_slice(key);
	let nonce = Nonce::from_slice(nonce);
	let cipher = Aes128Gcm::new(key);

	let mut payload = Vec::with_capacity(ciphertext.len() + tag.len());
	payload.extend_from_slice(ciphertext);
	payload.extend_from_slice(tag);

	cipher.decrypt(nonce, payload.as_ref())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn encrypt_then_decrypt_round_trips() {
		let key = [0x11u8; 16];
		let nonce = [0x22u8; 12];
		let plaintext = b"input event payload";

		let mut tag = [0u8; 16];
		let ciphertext = encrypt(plaintext, &key, &nonce, &mut tag).unwrap();
		let decrypted = decrypt(&ciphertext, &key, &nonce, &tag).unwrap();

		assert_eq!(decrypted, plaintext);
	}

	#[test]
	fn decrypt_rejects_tampered_tag() {
		let key = [0x11u8; 16];
		let nonce = [0x22u8; 12];

		let mut tag = [0u8; 16];
		let ciphertext = encrypt(b"hello", &key, &nonce, &mut tag).unwrap();
		tag[0] ^= 0xff;

		assert!(decrypt(&ciphertext, &key, &nonce, &tag).is_err());
	}

	#[test]
	fn gcm_nonce_is_the_leading_12_bytes_of_the_iv() {
		let mut iv = [0u8; 16];
		for (i, b) in iv.iter_mut().enumerate() {
			*b = i as u8;
		}

		assert_eq!(gcm_nonce_from_iv(&iv), [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);
	}
}
