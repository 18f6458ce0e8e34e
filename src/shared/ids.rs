use getrandom::getrandom;

const BASE36_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const SUFFIX_WIDTH: usize = 4;
const SUFFIX_SPACE: u32 = 36 * 36 * 36 * 36;

pub fn validate_identifier_value(kind: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{kind} must be non-empty"));
    }
    if value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Ok(());
    }
    Err(format!(
        "{kind} must use only ASCII letters, digits, '-' or '_'"
    ))
}

/// Compact sortable id: `<prefix>-<base36 timestamp>-<base36 random>`.
pub fn generate_id(prefix: &str, now: i64) -> Result<String, String> {
    validate_identifier_value("id prefix", prefix)?;
    let timestamp = u64::try_from(now)
        .map_err(|_| format!("{prefix} id requires a non-negative timestamp"))?;
    let mut bytes = [0_u8; 4];
    getrandom(&mut bytes)
        .map_err(|err| format!("{prefix} id randomness unavailable: {err}"))?;
    let sample = u32::from_le_bytes(bytes) % SUFFIX_SPACE;
    Ok(format!(
        "{prefix}-{}-{}",
        base36_encode_u64(timestamp),
        base36_encode_fixed_u32(sample, SUFFIX_WIDTH)
    ))
}

fn base36_encode_u64(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut chars = Vec::new();
    while value > 0 {
        chars.push(BASE36_ALPHABET[(value % 36) as usize] as char);
        value /= 36;
    }
    chars.iter().rev().collect()
}

fn base36_encode_fixed_u32(mut value: u32, width: usize) -> String {
    let mut chars = vec!['0'; width];
    for idx in (0..width).rev() {
        chars[idx] = BASE36_ALPHABET[(value % 36) as usize] as char;
        value /= 36;
    }
    chars.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_validation_rejects_empty_and_punctuation() {
        assert!(validate_identifier_value("thread id", "").is_err());
        assert!(validate_identifier_value("thread id", "a/b").is_err());
        assert!(validate_identifier_value("thread id", "thread_01-a").is_ok());
    }

    #[test]
    fn generated_ids_carry_prefix_and_are_unique_per_call() {
        let first = generate_id("req", 100).expect("generate");
        let second = generate_id("req", 100).expect("generate");
        assert!(first.starts_with("req-"));
        assert!(second.starts_with("req-"));
        // Same timestamp, random suffix keeps them distinct in practice.
        assert_eq!(first.split('-').count(), 3);
        assert_eq!(second.split('-').count(), 3);
    }

    #[test]
    fn generated_ids_reject_negative_timestamps() {
        assert!(generate_id("req", -5).is_err());
    }
}
