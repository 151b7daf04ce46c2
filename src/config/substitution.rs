//! `${NAME}` / `${NAME:default}` environment substitution for the YAML
//! configuration text, applied before parsing.

use anyhow::{anyhow, Result};

pub fn substitute_env(input: &str) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            let close = input[i..]
                .find('}')
                .map(|p| i + p)
                .ok_or_else(|| anyhow!("unterminated ${{...}} substitution near byte {i}"))?;
            let inner = &input[i + 2..close];
            let (name, default) = match inner.split_once(':') {
                Some((n, d)) => (n, Some(d)),
                None => (inner, None),
            };
            let value = match std::env::var(name) {
                Ok(v) => v,
                Err(_) => default
                    .ok_or_else(|| anyhow!("environment variable {name} is not set and no default was given"))?
                    .to_string(),
            };
            out.push_str(&value);
            i = close + 1;
        } else {
            let ch_len = input[i..].chars().next().map(|c| c.len_utf8()).unwrap_or(1);
            out.push_str(&input[i..i + ch_len]);
            i += ch_len;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_present_variable() {
        std::env::set_var("MT5_CRS_TEST_HOST", "10.0.0.1");
        let out = substitute_env("endpoint: ${MT5_CRS_TEST_HOST}:5555").unwrap();
        assert_eq!(out, "endpoint: 10.0.0.1:5555");
    }

    #[test]
    fn falls_back_to_default_when_unset() {
        std::env::remove_var("MT5_CRS_TEST_UNSET");
        let out = substitute_env("endpoint: ${MT5_CRS_TEST_UNSET:127.0.0.1}:5555").unwrap();
        assert_eq!(out, "endpoint: 127.0.0.1:5555");
    }

    #[test]
    fn errors_when_unset_and_no_default() {
        std::env::remove_var("MT5_CRS_TEST_MISSING");
        assert!(substitute_env("endpoint: ${MT5_CRS_TEST_MISSING}").is_err());
    }
}
