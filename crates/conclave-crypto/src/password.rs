use conclave_types::{Error, Result};

pub const DEFAULT_BCRYPT_COST: u32 = 12;
pub const MIN_BCRYPT_COST: u32 = 10;

pub fn hash_password(password: &str, cost: Option<u32>) -> Result<String> {
    let cost = cost.unwrap_or(DEFAULT_BCRYPT_COST);
    if cost < MIN_BCRYPT_COST {
        return Err(Error::InvalidInput(format!(
            "bcrypt cost must be at least {MIN_BCRYPT_COST}, got {cost}"
        )));
    }
    bcrypt::hash(password, cost).map_err(|e| Error::Internal(format!("bcrypt failed: {e}")))
}

pub fn verify_password(password: &str, hashed: &str) -> Result<bool> {
    bcrypt::verify(password, hashed)
        .map_err(|e| Error::InvalidInput(format!("invalid bcrypt hash: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify_round_trip() {
        let hashed = hash_password("hunter2", Some(MIN_BCRYPT_COST)).unwrap();
        assert!(verify_password("hunter2", &hashed).unwrap());
        assert!(!verify_password("hunter3", &hashed).unwrap());
    }

    #[test]
    fn rejects_weak_cost() {
        let err = hash_password("hunter2", Some(4)).err().unwrap();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
