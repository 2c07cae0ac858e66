// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 U.S. Federal Government (in countries where recognized)

//! Variable expansion for configuration values.
//!
//! Values may reference environment variables as `${NAME}`, which keeps
//! secrets such as the backend password out of the configuration file:
//!
//! ```toml
//! [backend]
//! password = "${CA_GATEWAY_BACKEND_PASSWORD}"
//! ```

use crate::error::{GatewayError, Result};

/// Expand `${NAME}` references from the process environment.
///
/// Unknown variables are an error so that a missing secret is caught at
/// startup instead of being sent to the CA as a literal string.
///
/// # Examples
///
/// ```
/// use usg_ca_gateway::config::expand_variables;
///
/// let value = expand_variables("plain value").unwrap();
/// assert_eq!(value, "plain value");
/// ```
pub fn expand_variables(input: &str) -> Result<String> {
    expand_with(input, |name| std::env::var(name).ok())
}

/// Expand `${NAME}` references using `lookup`.
pub(crate) fn expand_with<F>(input: &str, lookup: F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(var_start) = rest.find("${") {
        result.push_str(&rest[..var_start]);
        let after = &rest[var_start + 2..];

        let Some(var_end) = after.find('}') else {
            // No closing brace, keep the remainder verbatim
            result.push_str(&rest[var_start..]);
            return Ok(result);
        };

        let name = &after[..var_end];
        if name.is_empty() {
            return Err(GatewayError::config("empty variable reference '${}'"));
        }
        let value = lookup(name).ok_or_else(|| {
            GatewayError::config(format!("environment variable '{name}' is not set"))
        })?;
        result.push_str(&value);
        rest = &after[var_end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}

/// Expand an optional value in place.
pub(crate) fn expand_option(value: &mut Option<String>) -> Result<()> {
    if let Some(v) = value.as_mut() {
        *v = expand_variables(v)?;
    }
    Ok(())
}
