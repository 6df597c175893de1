use std::fmt::Write as _;
use std::fs;
use std::io::Read;
use std::time::{SystemTime, UNIX_EPOCH};

static ENTROPY_SOURCE: &str = "/dev/urandom";

/// Generates a prefixed identifier such as `ses_4f9a…`: the prefix, an
/// underscore, and 16 random bytes in hex. When the entropy source is
/// unavailable the bytes degrade to a time/pid mix, which is unique enough
/// for ids scoped to one server process.
pub(crate) fn new_id(prefix: &str) -> String {
    let mut bytes = [0u8; 16];
    let filled = fs::File::open(ENTROPY_SOURCE)
        .and_then(|mut source| source.read_exact(&mut bytes))
        .is_ok();
    if !filled {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let pid = std::process::id() as u128;
        bytes = (now ^ (pid << 64)).to_le_bytes();
    }

    let mut id = String::with_capacity(prefix.len() + 1 + bytes.len() * 2);
    id.push_str(prefix);
    id.push('_');
    for byte in bytes {
        let _ = write!(id, "{byte:02x}");
    }
    id
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
