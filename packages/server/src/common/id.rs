//! ID helpers.

use uuid::Uuid;

/// Generate a new record id.
pub fn db_id() -> Uuid {
    Uuid::new_v4()
}

/// A short human-readable prefix of an id for log fields.
pub fn short(id: Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_is_eight_chars() {
        assert_eq!(short(db_id()).len(), 8);
    }
}
