//! Reusable validator constructors attached by the field builders.

use std::sync::Arc;

use regex::Regex;

use crate::value::Value;

/// A validator inspects one canonical value and reports a message on failure.
/// All validators attached to a field run even after one fails.
pub type Validator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn len_of(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Bytes(b) => Some(b.len()),
        Value::Array(a) => Some(a.len()),
        _ => None,
    }
}

/// Validate a numeric value against an optional minimum/maximum.
pub fn min_max(min: Option<f64>, max: Option<f64>) -> Validator {
    Arc::new(move |value| {
        let n = match numeric(value) {
            Some(n) => n,
            None => return Ok(()),
        };
        if let Some(min) = min {
            if n < min {
                return Err(format!("{n} is less than minimum value of {min}."));
            }
        }
        if let Some(max) = max {
            if n > max {
                return Err(format!("{n} is greater than maximum value of {max}."));
            }
        }
        Ok(())
    })
}

/// Validate a value's length against an optional minimum/maximum.
pub fn length(min: Option<usize>, max: Option<usize>) -> Validator {
    Arc::new(move |value| {
        let len = match len_of(value) {
            Some(len) => len,
            None => return Ok(()),
        };
        if let Some(min) = min {
            if len < min {
                return Err(format!("value is under the minimum length of {min}."));
            }
        }
        if let Some(max) = max {
            if len > max {
                return Err(format!("value exceeds the maximum length of {max}."));
            }
        }
        Ok(())
    })
}

/// Better to accept than reject email addresses: just require one '@'.
pub fn email() -> Validator {
    let pattern = Regex::new(r"^[^@]+@[^@]+$").expect("static pattern");
    Arc::new(move |value| match value {
        Value::String(s) if pattern.is_match(s) => Ok(()),
        Value::String(s) => Err(format!("'{s}' is not a valid email address.")),
        _ => Ok(()),
    })
}

/// Permissive URL check: recognized scheme, plausible domain or IP address,
/// no whitespace in the path.
pub fn url() -> Validator {
    let domain = Regex::new(
        r"(?i)^(?:[A-Z0-9](?:[A-Z0-9-]{0,61}[A-Z0-9])?\.)+(?:[A-Z]{2,6}\.?|[A-Z0-9-]{2,})(?::\d+)?$",
    )
    .expect("static pattern");
    let path = Regex::new(r"^\S*$").expect("static pattern");
    Arc::new(move |value| {
        let text = match value {
            Value::String(s) => s.as_str(),
            _ => return Ok(()),
        };
        let (scheme, rest) = match text.split_once("://") {
            Some(parts) => parts,
            None => return Err(format!("'{text}' is not a valid URL.")),
        };
        if !matches!(
            scheme.to_ascii_lowercase().as_str(),
            "http" | "https" | "ftp" | "ftps"
        ) {
            return Err(format!("Unrecognized scheme: {scheme}"));
        }
        let (host, p) = match rest.split_once('/') {
            Some((host, p)) => (host, p),
            None => (rest, ""),
        };
        if !path.is_match(p) {
            return Err(format!("Invalid path: {p}"));
        }
        if !domain.is_match(host) {
            // Maybe it's an IP address, possibly with a port.
            let bare = host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host);
            if bare.parse::<std::net::IpAddr>().is_err()
                && host.parse::<std::net::IpAddr>().is_err()
            {
                return Err(format!("Invalid URL: {rest}"));
            }
        }
        Ok(())
    })
}

/// Validate a string against an arbitrary pattern.
pub fn matches(pattern: Regex, description: &str) -> Validator {
    let description = description.to_string();
    Arc::new(move |value| match value {
        Value::String(s) if pattern.is_match(s) => Ok(()),
        Value::String(s) => Err(format!("'{s}' is not a valid {description}.")),
        _ => Ok(()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_max() {
        let v = min_max(Some(1.0), Some(10.0));
        assert!(v(&Value::Int(5)).is_ok());
        assert!(v(&Value::Int(0)).is_err());
        assert!(v(&Value::Float(10.5)).is_err());
        // Non-numeric values are another validator's problem.
        assert!(v(&Value::String("x".into())).is_ok());
    }

    #[test]
    fn test_length() {
        let v = length(Some(2), Some(4));
        assert!(v(&Value::String("abc".into())).is_ok());
        assert!(v(&Value::String("a".into())).is_err());
        assert!(v(&Value::Array(vec![Value::Int(1); 5])).is_err());
    }

    #[test]
    fn test_email() {
        let v = email();
        assert!(v(&Value::String("jane@example.com".into())).is_ok());
        assert!(v(&Value::String("not-an-email".into())).is_err());
        assert!(v(&Value::String("two@@signs".into())).is_err());
    }

    #[test]
    fn test_url() {
        let v = url();
        assert!(v(&Value::String("https://example.com/a/b".into())).is_ok());
        assert!(v(&Value::String("http://127.0.0.1:8080/x".into())).is_ok());
        assert!(v(&Value::String("gopher://example.com".into())).is_err());
        assert!(v(&Value::String("example.com".into())).is_err());
        assert!(v(&Value::String("https://not a domain".into())).is_err());
    }
}
