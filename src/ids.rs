use once_cell::sync::Lazy;
use regex::Regex;

/// Random bytes behind a record id (24 hex chars).
const RECORD_ID_BYTES: usize = 12;
/// Random bytes behind a stored file suffix (12 hex chars).
const FILE_SUFFIX_BYTES: usize = 6;

static RECORD_ID_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-f0-9]{24}$").expect("valid regex"));

pub fn new_record_id() -> String {
    let bytes: [u8; RECORD_ID_BYTES] = rand::random();
    to_hex(&bytes)
}

pub fn new_file_suffix() -> String {
    let bytes: [u8; FILE_SUFFIX_BYTES] = rand::random();
    to_hex(&bytes)
}

pub fn new_csrf_token() -> String {
    let bytes: [u8; 32] = rand::random();
    to_hex(&bytes)
}

pub fn is_record_id(value: &str) -> bool {
    RECORD_ID_PATTERN.is_match(value)
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{:02x}", byte)).collect()
}
