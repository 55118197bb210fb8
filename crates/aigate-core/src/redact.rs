use std::fmt;

use aigate_provider_core::Headers;

const SENSITIVE: [&str; 4] = [
    "authorization",
    "x-api-key",
    "x-goog-api-key",
    "x-amz-security-token",
];

/// Formats headers for logs with credential values masked.
pub struct Redacted<'a>(pub &'a Headers);

impl fmt::Debug for Redacted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (name, value) in self.0 {
            if SENSITIVE.iter().any(|s| name.eq_ignore_ascii_case(s)) {
                map.entry(name, &"<redacted>");
            } else {
                map.entry(name, value);
            }
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_credentials() {
        let headers: Headers = vec![
            ("Authorization".into(), "Bearer sk-live".into()),
            ("x-amz-security-token".into(), "tok".into()),
            ("content-type".into(), "application/json".into()),
        ];
        let rendered = format!("{:?}", Redacted(&headers));
        assert!(!rendered.contains("sk-live"));
        assert!(!rendered.contains("tok\""));
        assert!(rendered.contains("application/json"));
    }
}
