use uuid::Uuid;

/// A new UID under the `2.25` root: the decimal form of a random UUID.
pub fn generate_uid() -> String {
    format!("2.25.{}", Uuid::new_v4().as_u128())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uids_are_unique_and_short_enough() {
        let first = generate_uid();
        let second = generate_uid();
        assert_ne!(first, second);
        assert!(first.starts_with("2.25."));
        assert!(first.len() <= 64);
        assert!(first[5..].bytes().all(|c| c.is_ascii_digit()));
    }
}
