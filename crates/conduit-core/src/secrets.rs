//! Secret values handed to runners at dispatch time.

use std::fmt;

/// A resolved secret. Never serialized and never printed.
#[derive(Clone)]
pub struct SecretValue {
    value: String,
}

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }

    pub fn expose(&self) -> &str {
        &self.value
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(***)")
    }
}

/// Replace every secret occurrence in `input` with `***`.
pub fn mask<'a>(input: &str, secrets: impl IntoIterator<Item = &'a SecretValue>) -> String {
    let mut output = input.to_string();
    for secret in secrets {
        if !secret.value.is_empty() {
            output = output.replace(&secret.value, "***");
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_does_not_leak() {
        let secret = SecretValue::new("hunter2");
        assert_eq!(format!("{:?}", secret), "SecretValue(***)");
    }

    #[test]
    fn test_mask() {
        let secrets = [SecretValue::new("hunter2"), SecretValue::new("")];
        assert_eq!(mask("token=hunter2;", &secrets), "token=***;");
    }
}
