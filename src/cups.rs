const CONTROL_DIGITS: &[u8; 23] = b"TRWAGMYFPDXBNJZSQVHLCKE";

/// Returns true when `cups` is a well-formed supply point identifier
pub fn check_cups_integrity(cups: &str) -> bool {
    let cups = cups.to_ascii_uppercase();
    if !cups.is_ascii() || !matches!(cups.len(), 20 | 22) {
        return false;
    }

    let digits = &cups[2..18];
    if !digits.bytes().all(|c| c.is_ascii_digit()) {
        return false;
    }
    let number: u64 = match digits.parse() {
        Ok(n) => n,
        Err(_) => return false,
    };

    let base = (number % 529) as usize;
    let expected = [CONTROL_DIGITS[base / 23], CONTROL_DIGITS[base % 23]];
    cups.as_bytes()[18..20] == expected
}

/// Shortest uppercase suffix (at least four chars) of `cups` not present in `taken`
pub fn short_code<F>(cups: &str, taken: F) -> String
where
    F: Fn(&str) -> bool,
{
    let cups = cups.to_ascii_uppercase();
    let min = cups.len().min(4);
    for len in min..=cups.len() {
        let candidate = &cups[cups.len() - len..];
        if !taken(candidate) {
            return candidate.to_string();
        }
    }
    cups
}
