use chrono::Utc;
use sha2::{Digest, Sha256};
use shared::types::UserAccount;
use uuid::Uuid;

const SALT_LEN: usize = 16;

/// New active account with a freshly generated id
pub fn new_account(username: &str, email: &str, password: &str) -> UserAccount {
    UserAccount {
        uuid: Uuid::new_v4().to_string(),
        username: username.to_string(),
        email: email.to_string(),
        password_hash: hash_password(password),
        status: "active".to_string(),
        creation_date: Utc::now(),
        last_login: None,
    }
}

/// `salt$digest`, both hex encoded
pub fn hash_password(password: &str) -> String {
    let salt = rand::random::<[u8; SALT_LEN]>();
    format!("{}${}", hex::encode(salt), digest(&salt, password))
}

fn digest(salt: &[u8], password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verify_password(password: &str, stored: &str) -> bool {
        let Some((salt, expected)) = stored.split_once('$') else {
            return false;
        };
        match hex::decode(salt) {
            Ok(salt) => digest(&salt, password) == expected,
            Err(_) => false,
        }
    }

    #[test]
    fn test_hash_is_salted() {
        let a = hash_password("p");
        let b = hash_password("p");
        assert_ne!(a, b, "Same password should hash differently with different salts");
        assert!(verify_password("p", &a));
        assert!(verify_password("p", &b));
    }

    #[test]
    fn test_wrong_password_fails() {
        let stored = hash_password("correct horse");
        assert!(!verify_password("battery staple", &stored));
        assert!(!verify_password("correct horse", "not-a-hash"));
    }

    #[test]
    fn test_new_account_never_stores_plaintext() {
        let account = new_account("alice", "a@x.com", "p");
        assert_ne!(account.password_hash, "p");
        assert_eq!(account.status, "active");
        assert!(Uuid::parse_str(&account.uuid).is_ok());
    }
}
