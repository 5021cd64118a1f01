//! Environment helpers shared by the binaries and the signaling crate.

use std::str::FromStr;

/// Read a boolean flag from the environment.
///
/// `1`, `true`, `yes` and `on` (any case) are truthy; any other set value is
/// false. Unset variables yield `default`.
pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => parse_bool(&value),
        Err(_) => default,
    }
}

/// Read and parse a value from the environment, falling back to `default`
/// when the variable is unset or does not parse.
pub fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Normalize a `host:port` listen address as peers see it.
///
/// Strips an accidental `http://` prefix and trailing slashes so the value
/// can be used both as a registry key and inside `http://{addr}/...` URLs.
pub fn normalize_peer_addr(addr: &str) -> String {
    let trimmed = addr.trim();
    let without_scheme = trimmed
        .strip_prefix("http://")
        .or_else(|| trimmed.strip_prefix("https://"))
        .unwrap_or(trimmed);
    without_scheme.trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_truthy_values() {
        for value in ["1", "true", "TRUE", " yes ", "On"] {
            assert!(parse_bool(value), "{value} should be truthy");
        }
        for value in ["0", "false", "", "off", "nope"] {
            assert!(!parse_bool(value), "{value} should be falsy");
        }
    }

    #[test]
    fn test_env_parse_falls_back_when_unset() {
        let value: u64 = env_parse("FULLMESH_TEST_SURELY_UNSET_VAR", 42);
        assert_eq!(value, 42);
        assert!(env_bool("FULLMESH_TEST_SURELY_UNSET_VAR", true));
    }

    #[test]
    fn test_normalize_peer_addr() {
        assert_eq!(normalize_peer_addr("127.0.0.1:50000"), "127.0.0.1:50000");
        assert_eq!(
            normalize_peer_addr(" http://127.0.0.1:60000/ "),
            "127.0.0.1:60000"
        );
        assert_eq!(normalize_peer_addr("https://peer.local:1/"), "peer.local:1");
    }
}
