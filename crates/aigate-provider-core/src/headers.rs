pub type Headers = Vec<(String, String)>;

pub fn header_set(headers: &mut Headers, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    let value = value.into();
    let mut replaced = false;
    headers.retain_mut(|(k, v)| {
        if !k.eq_ignore_ascii_case(&name) {
            return true;
        }
        if replaced {
            return false;
        }
        *v = value.clone();
        replaced = true;
        true
    });
    if !replaced {
        headers.push((name, value));
    }
}

pub fn header_append(headers: &mut Headers, name: impl Into<String>, value: impl Into<String>) {
    headers.push((name.into(), value.into()));
}

pub fn header_get<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Removes every value of `name`; returns the first one removed.
pub fn header_remove(headers: &mut Headers, name: &str) -> Option<String> {
    let mut first = None;
    headers.retain(|(k, v)| {
        if k.eq_ignore_ascii_case(name) {
            if first.is_none() {
                first = Some(v.clone());
            }
            false
        } else {
            true
        }
    });
    first
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_collapses_duplicates_case_insensitively() {
        let mut headers: Headers = vec![
            ("X-Tag".into(), "a".into()),
            ("x-tag".into(), "b".into()),
            ("Accept".into(), "*/*".into()),
        ];
        header_set(&mut headers, "x-TAG", "c");
        assert_eq!(
            headers,
            vec![("X-Tag".into(), "c".into()), ("Accept".into(), "*/*".into())]
        );
        assert_eq!(header_remove(&mut headers, "accept").as_deref(), Some("*/*"));
        assert_eq!(header_get(&headers, "ACCEPT"), None);
    }
}
