//! Property tests for the field envelopes.

use proptest::prelude::*;
use tidesync_crypto::{FieldCipher, FieldKey};

fn cipher() -> FieldCipher {
    FieldCipher::new(FieldKey::derive_for_user(b"property-secret", "prop-user").unwrap())
}

proptest! {
    #[test]
    fn string_envelope_roundtrips(text in ".{1,256}") {
        let cipher = cipher();
        let sealed = cipher.encrypt_string(&text).unwrap();
        prop_assert!(FieldCipher::is_encrypted_string(&sealed));
        prop_assert_eq!(cipher.decrypt_string(&sealed).unwrap(), text);
    }

    #[test]
    fn blob_envelope_roundtrips(data in proptest::collection::vec(any::<u8>(), 1..2048)) {
        let cipher = cipher();
        let sealed = cipher.encrypt_bytes(&data).unwrap();
        prop_assert!(FieldCipher::is_encrypted_blob(&sealed));
        prop_assert_eq!(cipher.decrypt_bytes(&sealed).unwrap(), data);
    }

    #[test]
    fn derived_keys_are_stable(user in "[a-z0-9-]{1,40}") {
        let a = FieldKey::derive_for_user(b"app", &user).unwrap();
        let b = FieldKey::derive_for_user(b"app", &user).unwrap();
        prop_assert_eq!(a.as_bytes(), b.as_bytes());
    }
}
