//! Lua script handles with precomputed hashes.

use crate::types::Value;
use sha1::{Digest, Sha1};

/// A Lua script together with its key count and hex-lowercase SHA-1.
///
/// The hash form is tried first (`EVALSHA`); callers fall back to the source
/// form (`EVAL`) when the server does not know the script yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    key_count: i64,
    src: String,
    hash: String,
}

impl Script {
    /// Create a script handle.
    ///
    /// When `key_count` is non-negative it is inserted into the argument
    /// list automatically; a negative count means the caller supplies the
    /// count as the first of `keys_and_args`.
    pub fn new(key_count: i64, src: impl Into<String>) -> Self {
        let src = src.into();
        let digest = Sha1::digest(src.as_bytes());
        Self {
            key_count,
            hash: hex::encode(digest),
            src,
        }
    }

    /// The hex-lowercase SHA-1 of the source.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// The script source.
    pub fn source(&self) -> &str {
        &self.src
    }

    /// The configured key count.
    pub fn key_count(&self) -> i64 {
        self.key_count
    }

    fn args(&self, spec: Value, keys_and_args: &[Value]) -> Vec<Value> {
        let mut args = Vec::with_capacity(2 + keys_and_args.len());
        args.push(spec);
        if self.key_count >= 0 {
            args.push(Value::Int(self.key_count));
        }
        args.extend_from_slice(keys_and_args);
        args
    }

    /// Arguments for running the script via its hash (`EVALSHA`).
    pub fn hash_and_args(&self, keys_and_args: &[Value]) -> Vec<Value> {
        self.args(Value::from(self.hash.as_str()), keys_and_args)
    }

    /// Arguments for running the script via its source (`EVAL`).
    pub fn script_and_args(&self, keys_and_args: &[Value]) -> Vec<Value> {
        self.args(Value::from(self.src.as_str()), keys_and_args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_hex_lowercase_sha1() {
        let script = Script::new(0, "return 1");
        // Well-known digest of "return 1".
        assert_eq!(script.hash(), "e0e1f9fabfc9d4800c877a703b823ac0578ff831");
        assert_eq!(script.hash().len(), 40);
        assert!(script.hash().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_args_with_key_count() {
        let script = Script::new(2, "return KEYS[1]");
        let args = script.hash_and_args(&[Value::from("k1"), Value::from("k2"), Value::from("a")]);
        assert_eq!(args.len(), 5);
        assert_eq!(args[0], Value::from(script.hash()));
        assert_eq!(args[1], Value::Int(2));
        assert_eq!(args[2], Value::from("k1"));
    }

    #[test]
    fn test_args_with_caller_supplied_count() {
        let script = Script::new(-1, "return 1");
        let args = script.script_and_args(&[Value::Int(0), Value::from("x")]);
        assert_eq!(args.len(), 3);
        assert_eq!(args[0], Value::from("return 1"));
        assert_eq!(args[1], Value::Int(0));
    }

    #[test]
    fn test_source_and_hash_forms_differ_only_in_spec() {
        let script = Script::new(0, "return ARGV[1]");
        let by_hash = script.hash_and_args(&[Value::from("v")]);
        let by_src = script.script_and_args(&[Value::from("v")]);
        assert_eq!(by_hash[1..], by_src[1..]);
        assert_ne!(by_hash[0], by_src[0]);
    }
}
